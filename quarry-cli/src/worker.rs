//! `quarry worker run <type>`: the body of each worker process

use quarry_client::{
    Context, FileWatcher, HttpEmbeddingProvider, RepairWorker, ShutdownFlag, Vectorizer, WorkerType,
};
use quarry_core::{PythonParser, Result};

/// Run one worker loop until SIGTERM or SIGINT.
pub fn run(ctx: &Context, worker_type: WorkerType) -> Result<()> {
    let shutdown = ShutdownFlag::install()?;
    tracing::info!(worker = %worker_type, pid = std::process::id(), "worker process starting");
    let config = &ctx.config;

    match worker_type {
        WorkerType::Watcher => {
            let parser = PythonParser::with_extensions(&config.indexing.extensions);
            FileWatcher::new(ctx.store(), &parser, &config.indexing, &config.workers).run(&shutdown);
        }
        WorkerType::Vectorizer => {
            let provider = HttpEmbeddingProvider::from_config(&config.vectorize)?;
            let mut vectorizer = Vectorizer::new(ctx.store(), &provider, &config.vectors_dir(), &config.vectorize);
            vectorizer.run(&shutdown, config.vectorize.poll_interval());
        }
        WorkerType::Repair => {
            RepairWorker::new(ctx.store(), config.workers.repair_batch_size)
                .run(&shutdown, config.workers.repair_poll_interval());
        }
    }
    Ok(())
}
