//! Shared application context.
//!
//! Built once at startup and handed to the [`Orchestrator`](crate::orchestrator::Orchestrator).
//! Breakers and the data cache live here so concurrent queries share them.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{Config, PipelineConfig, SandboxRuntime};
use crate::data::{ResilientDataAccess, RestDataProvider, SyntheticDataProvider};
use crate::debate::{AnalysisProvider, DebateProtocol, LlmAnalysisProvider, LocalAnalysisProvider};
use crate::error::AppResult;
use crate::gate::TruthGate;
use crate::llm::{CodeGenerator, LlmClient, Planner, TemplateCodeGenerator};
use crate::resilience::{RetryPolicy, SharedBreaker};
use crate::safety::SafetyGatekeeper;
use crate::sandbox::{DockerSandbox, ProcessSandbox, Sandbox};
use crate::storage::{FactStore, SqliteFactStore};

/// Breaker name for the market data dependency.
pub const MARKET_DATA_BREAKER: &str = "market_data";
/// Breaker name for model-backed debate analysis.
pub const LLM_BREAKER: &str = "llm";

/// Temperature for debate analysts.
const ANALYSIS_TEMPERATURE: f32 = 0.3;

/// Everything the pipeline needs to run a query.
#[derive(Clone)]
pub struct AppContext {
    pub pipeline: PipelineConfig,
    pub sandbox_timeout: Duration,
    pub safety: SafetyGatekeeper,
    pub planner: Planner,
    pub data: Arc<ResilientDataAccess>,
    pub market_breaker: SharedBreaker,
    pub sandbox: Arc<dyn Sandbox>,
    pub gate: TruthGate,
    pub debate: DebateProtocol,
    /// Best-effort persistence; `None` runs without a store
    pub store: Option<Arc<dyn FactStore>>,
}

impl AppContext {
    /// Wire up all components from configuration.
    ///
    /// Offline mode swaps the model-backed generator and analysts for the
    /// deterministic template and local implementations and uses
    /// synthetic market data.
    pub async fn from_config(config: &Config, offline: bool) -> AppResult<Self> {
        let market_breaker =
            SharedBreaker::new(MARKET_DATA_BREAKER, config.breakers.market_data.clone());
        let llm_breaker = SharedBreaker::new(LLM_BREAKER, config.breakers.llm.clone());

        let data = Arc::new(Self::build_data_access(config, offline)?);

        let sandbox: Arc<dyn Sandbox> = match config.sandbox.runtime {
            SandboxRuntime::Docker => Arc::new(DockerSandbox::new(config.sandbox.clone())),
            SandboxRuntime::Process => {
                warn!("Process sandbox selected; isolation is limited to rlimits and the Python preamble");
                Arc::new(ProcessSandbox::new(config.sandbox.clone()))
            }
        };

        let (generator, analyst): (Arc<dyn CodeGenerator>, Arc<dyn AnalysisProvider>) = if offline
        {
            (
                Arc::new(TemplateCodeGenerator::new()),
                Arc::new(LocalAnalysisProvider::new()),
            )
        } else {
            let code_client = LlmClient::new(&config.llm, config.request.clone())?;
            let analysis_client = LlmClient::new(&config.llm, config.request.clone())?
                .with_model(config.llm.analysis_model.clone())
                .with_temperature(ANALYSIS_TEMPERATURE);
            (
                Arc::new(code_client),
                Arc::new(LlmAnalysisProvider::new(Arc::new(analysis_client))),
            )
        };

        let store: Option<Arc<dyn FactStore>> = match SqliteFactStore::new(&config.database).await
        {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, path = %config.database.path.display(), "Fact store unavailable, continuing without persistence");
                None
            }
        };

        info!(
            offline,
            runtime = ?config.sandbox.runtime,
            providers = ?data.provider_names(),
            persistence = store.is_some(),
            "Application context ready"
        );

        Ok(Self {
            pipeline: config.pipeline.clone(),
            sandbox_timeout: config.sandbox.timeout(),
            safety: SafetyGatekeeper::new(),
            planner: Planner::new(generator),
            data,
            market_breaker,
            sandbox,
            gate: TruthGate::new(),
            debate: DebateProtocol::new(analyst, llm_breaker),
            store,
        })
    }

    fn build_data_access(config: &Config, offline: bool) -> AppResult<ResilientDataAccess> {
        let mut access = ResilientDataAccess::new(
            &config.data,
            config.breakers.market_data.clone(),
            RetryPolicy::from(&config.request),
        );

        let rest_url = config.data.api_base_url.as_ref().filter(|_| !offline);
        if let Some(base_url) = rest_url {
            let provider = RestDataProvider::new(
                "rest",
                base_url,
                config.data.api_key.clone(),
                &config.request,
            )?
            .with_min_interval(Duration::from_millis(config.data.min_interval_ms));
            access = access.with_provider(Arc::new(provider));
        } else {
            if !offline {
                warn!("DATA_API_BASE_URL not set; serving synthetic market data");
            }
            access = access.with_provider(Arc::new(SyntheticDataProvider::new()));
        }

        Ok(access)
    }

    /// Breaker guarding debate analysis calls.
    pub fn llm_breaker(&self) -> &SharedBreaker {
        self.debate.breaker()
    }
}
