use anyhow::{bail, Context};
use plantgraph::{BatchReport, Config, Pipeline};
use tokio::signal;
use tracing::{error, info};

const USAGE: &str = "usage: plantgraph <config.yaml> [seed | ingest <file>... | replay-dead-letters | live]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("plantgraph=info".parse()?),
        )
        .init();

    info!("{}", plantgraph::build_info::summary());

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        bail!(USAGE);
    };
    let command = args.next().unwrap_or_else(|| "seed".to_string());
    let files: Vec<String> = args.collect();

    let config = Config::from_file(&config_path)
        .with_context(|| format!("loading configuration {}", config_path))?;
    let pipeline = Pipeline::from_config(&config).context("starting pipeline")?;

    let stop = pipeline.stop_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal, stopping after the current chunk");
            stop.stop();
        }
    });

    let outcome = run(&pipeline, &config, &command, &files).await;

    pipeline.shutdown().await?;
    if let Err(e) = &outcome {
        error!("{:#}", e);
    }
    outcome
}

#[cfg_attr(not(feature = "mqtt"), allow(unused_variables))]
async fn run(pipeline: &Pipeline, config: &Config, command: &str, files: &[String]) -> anyhow::Result<()> {
    match command {
        "seed" => {
            let report = pipeline.seed_topology().await?;
            print_report("seed", &report)?;
        }
        "ingest" => {
            if files.is_empty() {
                bail!(USAGE);
            }
            pipeline.seed_topology().await?;
            for file in files {
                let report = pipeline
                    .ingest_path(file)
                    .await
                    .with_context(|| format!("ingesting {}", file))?;
                print_report(file, &report)?;
            }
            let stats = pipeline.graph_stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "replay-dead-letters" => {
            let report = pipeline.replay_dead_letters().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        #[cfg(feature = "mqtt")]
        "live" => {
            let Some(mqtt) = config.mqtt.clone() else {
                bail!("the live command needs an mqtt section");
            };
            pipeline.seed_topology().await?;
            let (tx, rx) = tokio::sync::mpsc::channel(1024);
            let source = tokio::spawn(plantgraph::MqttSource::new(mqtt).run(tx));
            let report = pipeline.run_live(rx).await?;
            source.abort();
            print_report("live", &report)?;
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
    Ok(())
}

fn print_report(source: &str, report: &BatchReport) -> anyhow::Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({ "source": source, "report": report }))?
    );
    Ok(())
}
