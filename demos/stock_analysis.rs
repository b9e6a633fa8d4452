//! Stock analysis worker example
//!
//! This example demonstrates how to:
//! 1. Define a typed analysis task
//! 2. Start a worker pool on whichever backend is reachable
//! 3. Submit work, poll results and read queue stats
//!
//! To run this example:
//! 1. Optionally start Redis and export TASK_QUEUE_REDIS_URL=redis://127.0.0.1:6379
//! 2. Run: cargo run --example stock_analysis

use analysis_task_queue::{
    Settings, Task, TaskClient, TaskContext, TaskError, TaskQueue, WorkerPool,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};

/// Analyse recent price action for one ticker
#[derive(Debug, Serialize, Deserialize)]
struct StockAnalysisTask {
    symbol: String,
    period_days: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct StockAnalysis {
    symbol: String,
    period_days: u32,
    trend: String,
    score: u8,
    summary: String,
}

#[async_trait::async_trait]
impl Task for StockAnalysisTask {
    type Output = StockAnalysis;

    async fn execute(&self, ctx: &TaskContext) -> anyhow::Result<Self::Output> {
        let symbol = self.symbol.trim().to_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphabetic()) {
            anyhow::bail!("invalid ticker symbol {:?}", self.symbol);
        }

        // Simulate fetching quotes and computing indicators
        for step in 1..=4u8 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ctx.progress.report(step * 25);
        }

        let score = (symbol.bytes().map(u32::from).sum::<u32>() % 100) as u8;
        let trend = match score {
            0..=33 => "bearish",
            34..=66 => "neutral",
            _ => "bullish",
        };

        Ok(StockAnalysis {
            summary: format!(
                "{} looks {} over the last {} days (score {})",
                symbol, trend, self.period_days, score
            ),
            symbol,
            period_days: self.period_days,
            trend: trend.to_string(),
            score,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting stock analysis example");

    let mut settings = Settings::from_env()?;
    settings.queue.retry.base_delay = Duration::from_millis(200);
    settings.queue.retry.max_retries = 1;

    let queue = Arc::new(TaskQueue::new(settings.queue.clone()).await);
    queue.register_task::<StockAnalysisTask>("stock_analysis").await;

    let pool = WorkerPool::new(settings.worker.clone(), queue.clone());
    pool.start().await?;

    let client = TaskClient::from_queue(queue.clone());

    let mut submitted = Vec::new();
    for symbol in ["AAPL", "msft", "NVDA", "BRK.B"] {
        let task = StockAnalysisTask {
            symbol: symbol.to_string(),
            period_days: 30,
        };
        let task_id = client.submit("stock_analysis", &task).await?;
        info!("Submitted analysis for {}: {}", symbol, task_id);
        submitted.push((symbol, task_id));
    }

    match client.submit("crypto_analysis", &serde_json::json!({})).await {
        Err(e @ TaskError::UnknownTaskType { .. }) => warn!("Rejected submission: {}", e),
        other => warn!("Unexpected submission outcome: {:?}", other),
    }

    for (symbol, task_id) in submitted {
        match client
            .wait_for_result::<StockAnalysis>(task_id, Some(Duration::from_secs(10)))
            .await
        {
            Ok(analysis) => info!("{}: {}", symbol, analysis.summary),
            Err(e) => warn!("{}: analysis unavailable ({})", symbol, e),
        }
    }

    let stats = client.stats().await?;
    info!("Queue stats: {}", serde_json::to_string_pretty(&stats)?);

    pool.shutdown().await?;
    Ok(())
}
