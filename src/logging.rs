//! Structured logging setup: dual JSON + human-readable file sinks, plus an
//! optional stdout sink for interactive runs. Secret masking helpers are
//! reused anywhere a credential could otherwise leak into a log line.

use log::Level;
use serde_json::json;
use std::path::Path;

/// Mask a short secret-like value, keeping only the first/last 4 chars visible.
pub fn mask_sensitive(input: &str) -> String {
    if input.len() <= 8 {
        return "***".to_string();
    }
    let visible = 4;
    let start = &input[..visible.min(input.len())];
    let end = &input[input.len().saturating_sub(visible)..];
    format!("{}...{}", start, end)
}

/// Mask the `Authorization: ApiKey user:key` header value for logging.
pub fn mask_api_key_header(username: &str, api_key: &str) -> String {
    format!("ApiKey {}:{}", username, mask_sensitive(api_key))
}

/// Parse `[PHASE: ...]`/`[STEP: ...]` tags out of a log message.
pub fn parse_log_metadata(message: &str) -> (Option<String>, Option<String>, String) {
    let mut phase = None;
    let mut step = None;
    let mut cleaned = message.to_string();

    if let Some(start) = message.find("[PHASE:") {
        if let Some(end) = message[start..].find(']') {
            phase = Some(message[start + 7..start + end].trim().to_string());
            cleaned = format!("{} {}", &message[..start], &message[start + end + 1..])
                .trim()
                .to_string();
        }
    }
    if let Some(start) = cleaned.find("[STEP:") {
        if let Some(end) = cleaned[start..].find(']') {
            step = Some(cleaned[start + 6..start + end].trim().to_string());
            cleaned = format!(
                "{} {}",
                &cleaned[..start],
                &cleaned[start + end + 1..]
            )
            .trim()
            .to_string();
        }
    }
    (phase, step, cleaned)
}

fn format_json_log(timestamp: &str, level: Level, target: &str, message: &str) -> String {
    let (phase, step, cleaned) = parse_log_metadata(message);
    let mut entry = json!({
        "timestamp": timestamp,
        "level": level.as_str(),
        "target": target,
        "message": cleaned,
    });
    if let Some(phase) = phase {
        entry["phase"] = json!(phase);
    }
    if let Some(step) = step {
        entry["step"] = json!(step);
    }
    serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string())
}

fn format_human_log(timestamp: &str, level: Level, target: &str, message: &str) -> String {
    let (phase, step, cleaned) = parse_log_metadata(message);
    let mut line = format!("[{}] [{}]", timestamp, level.as_str());
    if let Some(phase) = phase {
        line.push_str(&format!(" [PHASE: {}]", phase));
    }
    if let Some(step) = step {
        line.push_str(&format!(" [STEP: {}]", step));
    }
    line.push_str(&format!(" [{}] {}", target, cleaned));
    line
}

/// Initialize dual JSON/human-readable file logging under `log_dir`, with an
/// optional human-readable stdout sink for interactive CLI runs.
pub fn init_logging(log_dir: &Path, with_stdout: bool) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("mydata-agent-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("mydata-agent-{}.txt", timestamp));

    let mut dispatch = fern::Dispatch::new().level(log::LevelFilter::Debug);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let line =
                        format_human_log(&ts.to_string(), record.level(), record.target(), &message.to_string());
                    out.finish(format_args!("{}", line));
                })
                .chain(std::io::stdout()),
        );
    }

    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let ts = chrono::Utc::now().to_rfc3339();
                    let line =
                        format_json_log(&ts, record.level(), record.target(), &message.to_string());
                    out.finish(format_args!("{}\n", line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(|out, message, record| {
                    let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let line =
                        format_human_log(&ts.to_string(), record.level(), record.target(), &message.to_string());
                    out.finish(format_args!("{}\n", line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;
    log::info!("[PHASE: initialization] logging initialized (log_dir={:?})", log_dir);
    Ok(())
}
