use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use convo_core::ConvoClient;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::EngineConfig;
use crate::sync::dispatcher::QueryDispatcher;
use crate::sync::engine::SyncEngine;
use crate::sync::range::TimeRange;
use crate::sync::store::Store;
use crate::sync::{CONVERSATIONS, now_unix};
use crate::tools::{ToolError, ToolService};

const DEFAULT_BASE_URL: &str = "https://api.intercom.io";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub api_token: String,
    pub api_base_url: String,
    /// `None` uses the XDG data directory.
    pub db_path: Option<PathBuf>,
    pub engine: EngineConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_token = std::env::var("CONVO_API_TOKEN")
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .context("CONVO_API_TOKEN is not set")?;
        let api_base_url = std::env::var("CONVO_API_BASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let db_path = std::env::var_os("CONVO_DB_PATH")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            api_token,
            api_base_url,
            db_path,
            engine: EngineConfig::from_env(),
        })
    }
}

/// One line on stdin.
#[derive(Debug, Deserialize)]
struct ToolCall {
    #[serde(default)]
    id: Value,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Serialize)]
struct ToolReply {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ToolFailure>,
}

#[derive(Debug, Serialize)]
struct ToolFailure {
    code: &'static str,
    message: String,
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: Arc<SyncEngine>,
    tools: ToolService,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = match &config.db_path {
            Some(path) => Store::open_path(path)
                .await
                .with_context(|| format!("failed to open store at {}", path.display()))?,
            None => Store::new_default()
                .await
                .context("failed to initialize store")?,
        };
        let client = ConvoClient::with_base_url(&config.api_base_url, config.api_token.clone())
            .context("failed to build API client")?;
        let engine = SyncEngine::open(config.engine.clone(), store, client)
            .await
            .context("failed to load coverage")?;
        let tools = ToolService::new(QueryDispatcher::new(Arc::clone(&engine)));

        Ok(Self {
            config,
            engine,
            tools,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Serves tool calls from stdin until EOF or ctrl-c, sweeping stale
    /// coverage in the background.
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!(
            base_url = %self.config.api_base_url,
            sweep_secs = self.config.engine.sweep_interval.as_secs(),
            max_age_secs = self.config.engine.default_max_age.as_secs(),
            "convod started"
        );

        let engine_for_sweep = Arc::clone(&self.engine);
        let sweep_interval = self.config.engine.sweep_interval;
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; startup sweeps nothing useful.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if engine_for_sweep.is_shutting_down() {
                    break;
                }
                let jobs = engine_for_sweep.sweep_stale().await;
                if !jobs.is_empty() {
                    tracing::info!(jobs = jobs.len(), "sweep queued refresh jobs");
                }
            }
        });

        let serve = serve_lines(&self.tools);
        tokio::select! {
            result = serve => {
                if let Err(err) = result {
                    tracing::warn!(error = %err, "tool input closed with error");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
            }
        }

        sweep_handle.abort();
        self.engine.shutdown(SHUTDOWN_GRACE).await;
        Ok(())
    }

    /// Syncs the sweep lookback window of the conversation stream once and
    /// reports what happened.
    pub async fn sync_once(self) -> anyhow::Result<()> {
        let now = now_unix();
        let lookback = i64::try_from(self.config.engine.sweep_lookback.as_secs()).unwrap_or(i64::MAX);
        let range = TimeRange::new(now.saturating_sub(lookback), now)?;
        let wait = self.config.engine.max_job_duration.saturating_mul(2);
        let reports = self.engine.sync(CONVERSATIONS, range, false, wait).await;
        self.engine.shutdown(SHUTDOWN_GRACE).await;

        let reports = reports.context("sync failed")?;
        let records: u64 = reports.iter().map(|report| report.records).sum();
        tracing::info!(jobs = reports.len(), records, "one-shot sync finished");
        Ok(())
    }
}

async fn serve_lines(tools: &ToolService) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = handle_line(tools, &line).await;
        let mut encoded = serde_json::to_vec(&reply).map_err(std::io::Error::other)?;
        encoded.push(b'\n');
        stdout.write_all(&encoded).await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn handle_line(tools: &ToolService, line: &str) -> ToolReply {
    let call: ToolCall = match serde_json::from_str(line) {
        Ok(call) => call,
        Err(err) => {
            return failure(Value::Null, ToolError::InvalidArguments(err.to_string()));
        }
    };
    match tools.call(&call.tool, call.arguments).await {
        Ok(result) => ToolReply {
            id: call.id,
            result: Some(result),
            error: None,
        },
        Err(err) => {
            tracing::debug!(tool = %call.tool, code = err.code(), error = %err, "tool call failed");
            failure(call.id, err)
        }
    }
}

fn failure(id: Value, err: ToolError) -> ToolReply {
    ToolReply {
        id,
        result: None,
        error: Some(ToolFailure {
            code: err.code(),
            message: err.to_string(),
        }),
    }
}
