use std::env;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transactional_outbox::{OutboxRepository, SqlxOutboxRepository};

fn usage() -> ! {
    eprintln!("Usage (DATABASE_URL must be set):");
    eprintln!("  outbox-cli stats <max_attempts>");
    eprintln!("  outbox-cli requeue-exhausted <max_attempts>");
    eprintln!("  outbox-cli replay-since <rfc3339_ts>");
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        usage();
    }

    let db_url = env::var("DATABASE_URL")?;
    let repo = SqlxOutboxRepository::new(PgPool::connect(&db_url).await?);

    match args[1].as_str() {
        "stats" => {
            let max_attempts: i32 = args[2].parse()?;
            let stats = repo.pending_stats(max_attempts).await?;
            println!(
                "pending={} exhausted={} oldest_age_seconds={}",
                stats.pending, stats.exhausted, stats.oldest_age_seconds
            );
        }
        "requeue-exhausted" => {
            let max_attempts: i32 = args[2].parse()?;
            let count = repo.requeue_exhausted(max_attempts).await?;
            println!("Requeued {} exhausted events", count);
        }
        "replay-since" => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let count = repo.replay_since(ts).await?;
            println!("Replayed {} events since {}", count, ts);
        }
        _ => usage(),
    }

    Ok(())
}
