//! show_annotations - print annotation records as JSON

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use framewatch::{AnnotationStore, PipelineConfig, SqliteAnnotationStore};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Stream to print.
    #[arg(long)]
    stream: Option<String>,
    /// List the most recently updated streams instead.
    #[arg(long, default_value_t = 0)]
    list: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = PipelineConfig::load()?;
    let store = SqliteAnnotationStore::open(&config.storage.annotations_db)
        .with_context(|| format!("open annotations {}", config.storage.annotations_db))?;

    if args.list > 0 {
        for stream in store.streams(args.list)? {
            println!("{}", stream);
        }
        return Ok(());
    }

    let stream = args
        .stream
        .ok_or_else(|| anyhow!("--stream or --list is required"))?;
    let record = store
        .fetch(&stream)?
        .ok_or_else(|| anyhow!("no annotations for stream '{}'", stream))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
