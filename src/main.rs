//! # State Server Entry Point
//!
//! Builds the state tables, restores the last dump, keeps dumping on an
//! interval and writes a final dump on Ctrl-C.

use state::{DumpScheduler, GlbState, HistoryStore, NoHistory, SchedulerConfig, SqliteHistory, StateConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=================================================");
    println!("  Glaber State Cache                             ");
    println!("=================================================");
    println!();

    let config = StateConfig::from_env();
    println!("Configuration:");
    println!("  - Dump directory: {}", config.dump_dir.display());
    println!("  - Dump interval: {}s", config.dump_interval.as_secs());
    match config.cache_size {
        0 => println!("  - Cache memory: heap (unbounded)"),
        size => println!("  - Cache memory: {} bytes", size),
    }
    println!();

    let history: Arc<dyn HistoryStore> = match &config.history_db {
        Some(path) => match SqliteHistory::open(path) {
            Ok(store) => {
                println!("✓ History database opened: {}", path.display());
                Arc::new(store)
            }
            Err(e) => {
                eprintln!("✗ Failed to open history database {}: {}", path.display(), e);
                return Err(e.into());
            }
        },
        None => {
            println!("  No history database configured, misses are served from cache only");
            Arc::new(NoHistory)
        }
    };

    let scheduler_config = SchedulerConfig::from(&config);
    let state = Arc::new(GlbState::new(config, history));

    println!("Loading state...");
    let loaded = match state.load() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("✗ Failed to load state: {}", e);
            return Err(e.into());
        }
    };
    println!("✓ State loaded");
    println!("  - Items: {} ({} values)", loaded.items, loaded.values);
    println!("  - Triggers: {}", loaded.triggers);
    println!();

    let scheduler = Arc::new(DumpScheduler::new(state.clone(), scheduler_config));
    let scheduler_task = tokio::spawn(scheduler.clone().start());

    println!("State cache running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    scheduler_task.abort();

    println!();
    println!("Writing final dump...");
    match scheduler.run_once().await {
        Ok(dumped) => {
            println!("✓ Dumped {} items, {} values, {} triggers", dumped.items, dumped.values, dumped.triggers)
        }
        Err(e) => {
            eprintln!("✗ Final dump failed: {}", e);
            return Err(e.into());
        }
    }

    let stats = state.stats();
    println!("State Statistics:");
    println!("  - Hits: {}", stats.items.hits);
    println!("  - Misses: {}", stats.items.misses);
    println!("  - History requests: {}", stats.items.db_requests);
    println!("  - Memory used: {} bytes", stats.memory.used);
    println!();

    println!("=================================================");
    println!("  State Cache Shut Down");
    println!("=================================================");

    Ok(())
}
