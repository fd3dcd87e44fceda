mod client;
mod config;
mod encoder;
mod error;
mod ranker;
mod types;
mod validator;
mod workflow;

use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;

use client::HttpClassifier;
use config::Config;
use encoder::Base64Encoder;
use types::{RankedEntry, WorkflowState};
use validator::RawFile;
use workflow::WorkflowController;

const BAR_WIDTH: usize = 30;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let config = Config::parse();
    init_tracing(config.log_json);
    tracing::debug!("Starting with config: {:?}", config);

    let endpoint = config.endpoint()?;
    let classifier = HttpClassifier::new(endpoint.clone());
    let (workflow, controller) =
        WorkflowController::new(Arc::new(Base64Encoder), Arc::new(classifier));

    tokio::spawn(async move {
        controller.run_forever().await;
    });

    let mut file = RawFile::from_path(&config.image).await?;
    if let Some(mime) = &config.mime {
        file.mime = mime.clone();
    }

    // Render every transition the workflow publishes.
    let mut updates = workflow.subscribe();
    let renderer = tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let phase = updates.borrow_and_update().phase();
            tracing::info!(?phase, "Workflow phase changed");
        }
    });

    let staged = workflow.submit_file(file).await?;
    if let Some(image) = staged.image() {
        tracing::info!(
            file = image.name(),
            mime = image.mime(),
            size = image.size(),
            "Image staged"
        );
        tracing::info!(%endpoint, "Classifying image");
        workflow.classify().await?;
    }

    let state = workflow.settled().await?;
    drop(workflow);
    let _ = renderer.await;

    Ok(render(&state, config.top))
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,face_classifier=debug".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn render(state: &WorkflowState, top: Option<usize>) -> ExitCode {
    if let Some(message) = state.error_message() {
        eprintln!("Error: {message}");
        return ExitCode::FAILURE;
    }

    let (Some(label), Some(ranked)) = (state.winning_label(), state.ranked()) else {
        eprintln!("No classification result");
        return ExitCode::FAILURE;
    };

    let entries = match top {
        Some(n) => ranked.top(n),
        None => ranked.entries(),
    };
    println!("Prediction: {label}");
    if ranked.is_empty() {
        return ExitCode::SUCCESS;
    }
    println!("Confidence Scores:");
    let width = entries.iter().map(|e| e.label.len()).max().unwrap_or(0);
    for entry in entries {
        println!("{}", score_line(entry, width));
    }
    ExitCode::SUCCESS
}

fn score_line(entry: &RankedEntry, width: usize) -> String {
    let share = entry.probability.clamp(0.0, 100.0) / 100.0;
    let filled = (share * BAR_WIDTH as f64).round() as usize;
    format!(
        "  {:<width$}  {:>6}%  {}{}",
        entry.label,
        entry.probability,
        "█".repeat(filled),
        "░".repeat(BAR_WIDTH - filled),
    )
}
