//! Command-line entry point for the MyData agent core.
//!
//! Usage: `mydata-agent --settings <path> [--test-run] [--once]`

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use mydata_agent::controller::PipelineController;
use mydata_agent::events::PipelineEvent;
use mydata_agent::remote::HttpRemoteClient;
use mydata_agent::scan;
use mydata_agent::settings::Settings;
use mydata_agent::transfer::{SshScpTransfer, SshTarget};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();

    let settings_path = args
        .iter()
        .position(|a| a == "--settings")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("MyData.cfg"));

    let test_run = args.iter().any(|a| a == "--test-run");
    let once = args.iter().any(|a| a == "--once");

    if let Err(e) = run(&settings_path, test_run, once).await {
        eprintln!("mydata-agent: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(settings_path: &PathBuf, test_run: bool, once: bool) -> anyhow::Result<()> {
    let settings = Settings::load(settings_path)?;
    if let Some(field) = settings.required_field_is_blank() {
        anyhow::bail!("MyData.cfg is missing a value for required field '{}'", field);
    }

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("MyData")
        .join("logs");
    mydata_agent::logging::init_logging(&log_dir, true)?;

    info!(
        "[PHASE: main] [STEP: startup] starting mydata-agent (settings={:?}, test_run={}, once={})",
        settings_path, test_run, once
    );

    loop {
        run_once(&settings, test_run).await?;
        if once {
            break;
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    Ok(())
}

async fn run_once(settings: &Settings, test_run: bool) -> anyhow::Result<()> {
    let run_id = uuid::Uuid::new_v4().to_string();
    info!("[PHASE: main] [STEP: run] starting scan/verify/upload cycle (run_id={})", run_id);

    let remote = Arc::new(HttpRemoteClient::new(
        settings.mytardis_url.clone(),
        settings.username.clone(),
        settings.api_key.clone(),
    )?);

    let transfer = Arc::new(SshScpTransfer::new(
        SshTarget {
            host: url::Url::parse(&settings.mytardis_url)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_default(),
            port: settings.ssh_port,
            username: settings.username.clone(),
            private_key_path: settings.ssh_private_key_path.clone(),
            cipher: settings.cipher.clone(),
            use_none_cipher: settings.use_none_cipher,
        },
        Duration::from_secs(300),
    ));

    let (events_tx, mut events_rx) = mydata_agent::events::channel();
    let controller = PipelineController::new(settings.clone(), remote, transfer, events_tx.clone(), test_run);

    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::with_template("{spinner} {msg}").unwrap());
    let progress_task = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                PipelineEvent::ScanProgress { scanned, total } => {
                    progress.set_message(format!("scanned {}/{} folders", scanned, total));
                }
                PipelineEvent::Message { text, .. } => progress.println(text),
                PipelineEvent::UploadProgress {
                    bytes_uploaded,
                    total_bytes,
                    ..
                } => {
                    progress.set_message(format!("uploading {}/{} bytes", bytes_uploaded, total_bytes));
                }
                PipelineEvent::RunFinished { summary } => {
                    progress.finish_with_message(summary);
                    break;
                }
                _ => {}
            }
        }
    });

    controller.init_for_uploads().await?;
    let folders = scan::scan_folders(settings, &events_tx).await?;
    for folder in folders {
        controller.start_uploads_for_folder(folder).await;
    }
    controller.finished_scanning_for_dataset_folders().await;
    let summary = controller.run_to_completion().await;
    info!("[PHASE: main] [STEP: run] (run_id={}) {}", run_id, summary);

    let _ = progress_task.await;
    Ok(())
}
