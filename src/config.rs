//! # Configuration Module
//!
//! Loads the runtime configuration from environment variables (and a `.env`
//! file when present), validates it, and turns it into the library-facing
//! [`EngineConfig`], [`RouterConfig`] and [`MemoryConfig`] plus the concrete
//! search providers and language model.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use deep_research::{
    EngineConfig, ExaSearchProvider, FirecrawlSearchProvider, LanguageModel, LlmBackend,
    MemoryConfig, RigLanguageModel, RouterConfig, SearchRouter, SourcePolicy, TavilySearchProvider,
    WikipediaSearchProvider,
};

const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Main configuration for the research agent.
#[derive(Debug, Clone)]
pub struct Config {
    /// Language model backend (`ollama` or `openai`)
    pub llm_provider: LlmBackend,

    /// Model name; `None` picks the backend default
    pub model: Option<String>,

    /// Ollama server URL (default: http://localhost:11434)
    pub ollama_host: String,

    /// Temperature for LLM responses (0.0 = deterministic)
    pub temperature: f64,

    pub exa_api_key: Option<String>,
    pub firecrawl_api_key: Option<String>,
    pub tavily_api_key: Option<String>,

    /// Register Exa as a primary provider when its key is set
    pub use_exa_primary: bool,

    /// Register Firecrawl as a primary provider when its key is set
    pub use_firecrawl_primary: bool,

    pub max_concurrency: usize,
    pub max_outbound_calls: usize,
    pub max_results_per_query: usize,
    pub max_evidence_per_sub_question: usize,
    pub max_candidates_per_domain: usize,
    pub provider_timeout_secs: u64,
    pub research_timeout_secs: u64,
    pub quality_pass_score: u8,
    pub history_window: usize,
    pub report_memory_window: usize,

    /// Paid search calls allowed per research run
    pub max_search_calls_per_run: usize,

    /// Sources accepted across all sub-questions of one run
    pub max_accepted_sources: usize,

    /// Skip a provider for the rest of the run once it reports quota exhaustion
    pub fail_fast_on_quota: bool,

    pub source_policy: SourcePolicy,

    /// Register Wikipedia as the keyless reference provider
    pub use_wikipedia_reference: bool,
    pub wikipedia_user_agent: Option<String>,

    /// Sub-question ids whose searches are skipped, e.g. `sq2,sq4`
    pub simulated_failures: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_provider: LlmBackend::Ollama,
            model: None,
            ollama_host: "http://localhost:11434".to_string(),
            // Low temperature: planning and summaries must return parseable JSON
            temperature: 0.2,
            exa_api_key: None,
            firecrawl_api_key: None,
            tavily_api_key: None,
            use_exa_primary: true,
            use_firecrawl_primary: true,
            max_concurrency: 4,
            max_outbound_calls: 6,
            max_results_per_query: 3,
            max_evidence_per_sub_question: 4,
            max_candidates_per_domain: 2,
            provider_timeout_secs: 20,
            research_timeout_secs: 180,
            quality_pass_score: 72,
            history_window: 12,
            report_memory_window: 12,
            max_search_calls_per_run: 40,
            max_accepted_sources: 15,
            fail_fast_on_quota: true,
            source_policy: SourcePolicy::HybridTrustedFirst,
            use_wikipedia_reference: true,
            wikipedia_user_agent: None,
            simulated_failures: Vec::new(),
        }
    }
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults; malformed ones are errors.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Some(provider) = env_var("LLM_PROVIDER") {
            config.llm_provider = LlmBackend::from_str(&provider)
                .map_err(anyhow::Error::msg)
                .context("LLM_PROVIDER must be 'ollama' or 'openai'")?;
        }

        config.model = env_var("LLM_MODEL").or_else(|| env_var("OLLAMA_MODEL"));

        if let Some(val) = env_var("OLLAMA_API_BASE_URL") {
            config.ollama_host = val;
        }

        if let Some(val) = env_var("TEMPERATURE") {
            config.temperature = val
                .parse()
                .context("TEMPERATURE must be a valid floating-point number (e.g., 0.2)")?;
        }

        config.exa_api_key = env_var("EXA_API_KEY");
        config.firecrawl_api_key = env_var("FIRECRAWL_API_KEY");
        config.tavily_api_key = env_var("TAVILY_API_KEY");

        if let Some(val) = env_var("USE_EXA_PRIMARY") {
            config.use_exa_primary = parse_flag(&val).context("USE_EXA_PRIMARY must be true or false")?;
        }
        if let Some(val) = env_var("USE_FIRECRAWL_PRIMARY") {
            config.use_firecrawl_primary =
                parse_flag(&val).context("USE_FIRECRAWL_PRIMARY must be true or false")?;
        }

        parse_into("MAX_CONCURRENCY", &mut config.max_concurrency)?;
        parse_into("MAX_OUTBOUND_CALLS", &mut config.max_outbound_calls)?;
        parse_into("MAX_RESULTS_PER_QUERY", &mut config.max_results_per_query)?;
        parse_into("MAX_EVIDENCE_PER_SUB_QUESTION", &mut config.max_evidence_per_sub_question)?;
        parse_into("SEARCH_MAX_CANDIDATES_PER_DOMAIN", &mut config.max_candidates_per_domain)?;
        parse_into("PROVIDER_TIMEOUT_SECS", &mut config.provider_timeout_secs)?;
        parse_into("RESEARCH_TIMEOUT_SECS", &mut config.research_timeout_secs)?;
        parse_into("QUALITY_PASS_SCORE", &mut config.quality_pass_score)?;
        parse_into("HISTORY_WINDOW", &mut config.history_window)?;
        parse_into("REPORT_MEMORY_WINDOW", &mut config.report_memory_window)?;
        parse_into("MAX_ACCEPTED_SOURCES_TOTAL", &mut config.max_accepted_sources)?;

        // TAVILY_MAX_CALLS_PER_RUN is the older name for the same cap
        if env_var("SEARCH_MAX_CALLS_PER_RUN").is_some() {
            parse_into("SEARCH_MAX_CALLS_PER_RUN", &mut config.max_search_calls_per_run)?;
        } else {
            parse_into("TAVILY_MAX_CALLS_PER_RUN", &mut config.max_search_calls_per_run)?;
        }

        if let Some(val) = env_var("SEARCH_FAIL_FAST_ON_QUOTA") {
            config.fail_fast_on_quota =
                parse_flag(&val).context("SEARCH_FAIL_FAST_ON_QUOTA must be true or false")?;
        }
        if let Some(val) = env_var("SOURCE_POLICY") {
            config.source_policy = SourcePolicy::from_str(&val).map_err(anyhow::Error::msg)?;
        }
        if let Some(val) = env_var("USE_WIKIPEDIA_REFERENCE") {
            config.use_wikipedia_reference =
                parse_flag(&val).context("USE_WIKIPEDIA_REFERENCE must be true or false")?;
        }
        config.wikipedia_user_agent = env_var("WIKIPEDIA_USER_AGENT");

        if let Some(val) = env_var("SIMULATE_RESEARCH_FAILURE_SUBQS") {
            config.simulated_failures = parse_id_list(&val);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!("Temperature must be between 0.0 and 2.0, got: {}", self.temperature);
        }

        if self.model.as_deref().is_some_and(|m| m.trim().is_empty()) {
            anyhow::bail!("LLM_MODEL cannot be empty");
        }

        let positive = [
            ("MAX_CONCURRENCY", self.max_concurrency),
            ("MAX_OUTBOUND_CALLS", self.max_outbound_calls),
            ("MAX_RESULTS_PER_QUERY", self.max_results_per_query),
            ("MAX_EVIDENCE_PER_SUB_QUESTION", self.max_evidence_per_sub_question),
            ("SEARCH_MAX_CANDIDATES_PER_DOMAIN", self.max_candidates_per_domain),
            ("HISTORY_WINDOW", self.history_window),
            ("REPORT_MEMORY_WINDOW", self.report_memory_window),
            ("SEARCH_MAX_CALLS_PER_RUN", self.max_search_calls_per_run),
            ("MAX_ACCEPTED_SOURCES_TOTAL", self.max_accepted_sources),
        ];
        for (name, value) in positive {
            if value == 0 {
                anyhow::bail!("{} must be at least 1", name);
            }
        }

        if self.provider_timeout_secs == 0 || self.research_timeout_secs == 0 {
            anyhow::bail!("PROVIDER_TIMEOUT_SECS and RESEARCH_TIMEOUT_SECS must be at least 1");
        }

        if self.quality_pass_score > 100 {
            anyhow::bail!("QUALITY_PASS_SCORE must be between 0 and 100, got: {}", self.quality_pass_score);
        }

        if !self.has_search_provider() {
            anyhow::bail!(
                "No search provider configured: set EXA_API_KEY, FIRECRAWL_API_KEY or TAVILY_API_KEY"
            );
        }

        Ok(())
    }

    /// Model name after applying the backend default.
    pub fn model_name(&self) -> &str {
        match (&self.model, self.llm_provider) {
            (Some(model), _) => model,
            (None, LlmBackend::Ollama) => DEFAULT_OLLAMA_MODEL,
            (None, LlmBackend::OpenAi) => DEFAULT_OPENAI_MODEL,
        }
    }

    fn exa_enabled(&self) -> bool {
        self.use_exa_primary && self.exa_api_key.is_some()
    }

    fn firecrawl_enabled(&self) -> bool {
        self.use_firecrawl_primary && self.firecrawl_api_key.is_some()
    }

    pub fn has_search_provider(&self) -> bool {
        self.exa_enabled() || self.firecrawl_enabled() || self.tavily_api_key.is_some()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_max_concurrency(self.max_concurrency)
            .with_research_timeout(Duration::from_secs(self.research_timeout_secs))
            .with_quality_pass_score(self.quality_pass_score)
            .with_simulated_failures(self.simulated_failures.clone())
            .with_source_policy(self.source_policy)
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig::new()
            .with_max_results_per_query(self.max_results_per_query)
            .with_max_evidence(self.max_evidence_per_sub_question)
            .with_max_per_domain(self.max_candidates_per_domain)
            .with_provider_timeout(Duration::from_secs(self.provider_timeout_secs))
            .with_max_outbound_calls(self.max_outbound_calls)
            .with_max_calls_per_run(self.max_search_calls_per_run)
            .with_max_sources_per_run(self.max_accepted_sources)
            .with_fail_fast_on_quota(self.fail_fast_on_quota)
    }

    pub fn memory_config(&self) -> MemoryConfig {
        MemoryConfig::new()
            .with_history_window(self.history_window)
            .with_report_window(self.report_memory_window)
    }

    /// Router with every enabled primary, Tavily as fallback and Wikipedia
    /// as the reference provider.
    ///
    /// With no primary enabled, Tavily is promoted to the only primary.
    pub fn build_router(&self) -> SearchRouter {
        let timeout = Duration::from_secs(self.provider_timeout_secs);
        let mut router = SearchRouter::new(self.router_config());

        if let (true, Some(key)) = (self.use_exa_primary, &self.exa_api_key) {
            router = router.with_primary(Arc::new(ExaSearchProvider::new(key.clone()).with_timeout(timeout)));
        }
        if let (true, Some(key)) = (self.use_firecrawl_primary, &self.firecrawl_api_key) {
            router = router
                .with_primary(Arc::new(FirecrawlSearchProvider::new(key.clone()).with_timeout(timeout)));
        }

        if let Some(key) = &self.tavily_api_key {
            let tavily = Arc::new(
                TavilySearchProvider::new(key.clone()).with_total_timeout(timeout.mul_f64(0.9)),
            );
            router = if router.primary_names().is_empty() {
                warn!("No primary search provider enabled; using Tavily as the only provider");
                router.with_primary(tavily)
            } else {
                router.with_fallback(tavily)
            };
        }

        if self.use_wikipedia_reference {
            let mut wikipedia = WikipediaSearchProvider::new().with_timeout(timeout);
            if let Some(agent) = &self.wikipedia_user_agent {
                wikipedia = wikipedia.with_user_agent(agent.clone());
            }
            router = router.with_reference(Arc::new(wikipedia));
        }

        info!(
            primaries = ?router.primary_names(),
            fallback = router.has_fallback(),
            reference = router.has_reference(),
            "Search router configured"
        );
        router
    }

    pub fn build_llm(&self) -> Result<Arc<dyn LanguageModel>> {
        let model = self.model_name().to_string();
        let llm = match self.llm_provider {
            LlmBackend::Ollama => {
                RigLanguageModel::ollama(&self.ollama_host, model).context("Failed to create Ollama client")?
            }
            LlmBackend::OpenAi => RigLanguageModel::openai(model).context("Failed to create OpenAI client")?,
        };
        Ok(Arc::new(llm.with_temperature(self.temperature)))
    }
}

/// Non-empty, trimmed environment variable.
fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_into<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(val) = env_var(name) {
        *target = val
            .parse()
            .with_context(|| format!("{} must be a valid non-negative integer, got: {}", name, val))?;
    }
    Ok(())
}

fn parse_flag(val: &str) -> Result<bool> {
    match val.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("not a boolean: {}", other),
    }
}

/// `"sq2, SQ4,,"` → `["sq2", "sq4"]`
fn parse_id_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|id| id.trim().to_ascii_lowercase())
        .filter(|id| !id.is_empty())
        .collect()
}
