use chrono::Utc;
use claude_session::{ContentBlock, Message};
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(headers: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(cell.len());
            }
        }
    }

    let header_row: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_row.join("  ").trim_end());

    let sep: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    println!("{}", sep.join("  "));

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| {
                let w = widths.get(i).copied().unwrap_or(0);
                format!("{:width$}", cell, width = w)
            })
            .collect();
        println!("{}", cells.join("  ").trim_end());
    }
}

/// One transcript line per message: `{"received_at": …, "message": {…}}`.
pub fn print_message_json(msg: &Message) -> anyhow::Result<()> {
    let line = serde_json::json!({
        "received_at": Utc::now().to_rfc3339(),
        "message": msg,
    });
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

/// Human-readable transcript. Stream events are shown only when `verbose`.
pub fn print_message(msg: &Message, verbose: bool) {
    match msg {
        Message::System(sys) => {
            println!(
                "[system] session {} model {}",
                sys.session_id.as_deref().unwrap_or("-"),
                sys.model.as_deref().unwrap_or("-")
            );
        }
        Message::Assistant(_) | Message::User(_) => {
            let role = msg.kind();
            for block in msg.content() {
                match block {
                    ContentBlock::Text { text } if role == "assistant" => println!("{text}"),
                    ContentBlock::Text { text } => println!("[user] {text}"),
                    ContentBlock::ToolUse { id, name, input } => {
                        println!("[tool_use {id}] {name} {input}")
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let tag = if *is_error { "tool_error" } else { "tool_result" };
                        println!("[{tag} {tool_use_id}] {}", first_line(content));
                    }
                    ContentBlock::Thinking { thinking } if verbose => {
                        println!("[thinking] {}", first_line(thinking))
                    }
                    ContentBlock::Thinking { .. } => {}
                }
            }
        }
        Message::StreamEvent(ev) if verbose => println!("[event] {}", ev.event_type),
        Message::StreamEvent(_) => {}
        Message::Result(r) => {
            if let Some(text) = r.result_text() {
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            println!("\n---");
            println!(
                "Result: {}  Turns: {}  Tokens: {} in / {} out  Cost: ${:.4}",
                r.subtype,
                r.num_turns.unwrap_or(0),
                r.usage.input_tokens,
                r.usage.output_tokens,
                r.cost_usd.unwrap_or(0.0)
            );
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
