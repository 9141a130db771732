//! DTA Pipeline Engine (C5) — spec §4.5.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::catalog::ModelCatalog;
use crate::config::Config;
use crate::credential::CredentialVault;
use crate::error::{Error, Result};
use crate::evaluation::EvaluationHook;
use crate::pipeline::store::AnalysisStore;
use crate::pipeline::types::{Analysis, NoopRedactor, PipelineInput, Redactor, StageParams};
use crate::provider::{ChatMessage, ExecRequest, MultiProviderClient};
use crate::trace::{SpanType, Status, TraceRecorder, TraceSource};

pub struct PipelineEngine {
    catalog: Arc<ModelCatalog>,
    credentials: Arc<CredentialVault>,
    client: Arc<MultiProviderClient>,
    traces: Arc<TraceRecorder>,
    analyses: Arc<AnalysisStore>,
    config: Arc<Config>,
    redactor: Arc<dyn Redactor>,
    evaluation_hook: Option<Arc<EvaluationHook>>,
}

impl PipelineEngine {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        credentials: Arc<CredentialVault>,
        client: Arc<MultiProviderClient>,
        traces: Arc<TraceRecorder>,
        analyses: Arc<AnalysisStore>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            credentials,
            client,
            traces,
            analyses,
            config,
            redactor: Arc::new(NoopRedactor),
            evaluation_hook: None,
        }
    }

    pub fn with_redactor(mut self, redactor: Arc<dyn Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn with_evaluation_hook(mut self, hook: Arc<EvaluationHook>) -> Self {
        self.evaluation_hook = Some(hook);
        self
    }

    /// Runs the 3-stage DTA pipeline (spec §4.5 algorithm). Atomic at
    /// Analysis granularity: on any stage failure, no Analysis row is
    /// written, and the partial traces remain only for observability.
    ///
    /// `cancel` is checked before each stage and raced against the in-flight
    /// Adapter call; a cancellation closes the in-flight span and the parent
    /// trace as `cancelled` and returns without writing an Analysis (spec §5).
    #[instrument(skip(self, input, cancel), fields(tenant = %input.tenant))]
    pub async fn run(&self, input: PipelineInput, cancel: CancellationToken) -> Result<Analysis> {
        let transcript = if input.redact_pii {
            self.redactor.redact(&input.transcript)
        } else {
            input.transcript.clone()
        };

        let mut metadata = serde_json::json!({});
        if let Some(title) = &input.title {
            metadata["title"] = serde_json::json!(title);
        }
        if let Some(project) = &input.project {
            metadata["project"] = serde_json::json!(project);
        }

        let parent = self.traces.open_parent(
            TraceSource::DtaPipeline,
            "dta_pipeline",
            &input.tenant,
            &input.creator,
            input.project.as_deref(),
        )?;
        self.traces.link_metadata(&parent, metadata)?;

        let mut stage_outputs: [String; 3] = Default::default();
        let mut stage_params: std::collections::HashMap<String, StageParams> =
            std::collections::HashMap::new();
        let mut total_tokens: u32 = 0;
        let mut total_cost: f64 = 0.0;
        let mut total_duration_ms: u64 = 0;

        for (idx, stage_cfg) in input.stage_config.iter().enumerate() {
            let stage_num = (idx + 1) as u8;

            if cancel.is_cancelled() {
                self.traces.close_parent(&parent, Status::Cancelled)?;
                return Err(Error::Cancelled);
            }
            let context = match stage_num {
                1 => transcript.clone(),
                2 => stage_outputs[0].clone(),
                3 => format!("{}\n{}", stage_outputs[0], stage_outputs[1]),
                _ => unreachable!(),
            };

            let catalog_entry = self.catalog.lookup(&stage_cfg.model_name)?;
            let messages = vec![
                ChatMessage::system(stage_cfg.system_prompt.clone()),
                ChatMessage::user(context),
            ];
            let request = ExecRequest::new(stage_cfg.model_name.clone(), messages)
                .with_temperature(stage_cfg.params.temperature)
                .with_top_p(stage_cfg.params.top_p)
                .with_max_tokens(stage_cfg.params.max_tokens);

            let span = self.traces.open_span(
                &parent,
                &format!("stage_{stage_num}"),
                SpanType::Llm,
                Some(&stage_cfg.model_name),
                serde_json::json!({
                    "stage": stage_num,
                    "temperature": stage_cfg.params.temperature,
                    "top_p": stage_cfg.params.top_p,
                    "max_tokens": stage_cfg.params.max_tokens,
                }),
            )?;

            match self
                .run_stage_with_retry(
                    &catalog_entry,
                    &request,
                    stage_num,
                    &input.tenant,
                    input.project.as_deref(),
                    &cancel,
                )
                .await
            {
                Ok((result, attempt_count)) => {
                    if result.content.is_empty() {
                        self.traces.close_span_failed(&span, Status::Error, attempt_count)?;
                        self.traces.close_parent(&parent, Status::Error)?;
                        return Err(Error::pipeline(stage_num, "empty stage output"));
                    }
                    self.traces.close_span_ok(&span, &result, attempt_count)?;

                    let effective_temp = crate::provider::effective_temperature(
                        &request,
                        &catalog_entry.parameter_profile,
                    );
                    stage_params.insert(
                        stage_num.to_string(),
                        StageParams::new(effective_temp, stage_cfg.params.top_p, stage_cfg.params.max_tokens),
                    );
                    stage_outputs[idx] = result.content;
                    total_tokens += result.total_tokens();
                    total_cost += result.total_cost;
                    total_duration_ms += result.duration_ms;
                }
                Err(e) => {
                    let status = match &e {
                        Error::Timeout { .. } => Status::Timeout,
                        Error::Cancelled => Status::Cancelled,
                        _ => Status::Error,
                    };
                    self.traces.close_span_failed(&span, status, self.config.provider_config(catalog_entry.provider).max_retries + 1)?;
                    self.traces.close_parent(&parent, status)?;
                    if matches!(e, Error::Cancelled) {
                        return Err(e);
                    }
                    return Err(Error::pipeline(stage_num, e.to_string()));
                }
            }
        }

        self.traces.close_parent(&parent, Status::Ok)?;

        let now = Utc::now();
        let analysis = Analysis {
            id: AnalysisStore::new_id(),
            tenant: input.tenant.clone(),
            creator: input.creator.clone(),
            project: input.project.clone(),
            transcript_title: input.title.clone(),
            transcript_input: transcript,
            pii_redacted: input.redact_pii,
            facts_output: stage_outputs[0].clone(),
            insights_output: stage_outputs[1].clone(),
            summary_output: stage_outputs[2].clone(),
            stage_params,
            system_prompt: [
                input.stage_config[0].system_prompt.clone(),
                input.stage_config[1].system_prompt.clone(),
                input.stage_config[2].system_prompt.clone(),
            ],
            model: [
                input.stage_config[0].model_name.clone(),
                input.stage_config[1].model_name.clone(),
                input.stage_config[2].model_name.clone(),
            ],
            total_tokens,
            total_cost,
            total_duration_ms,
            parent_trace_id: parent.id.clone(),
            created_at: now,
            updated_at: now,
        };
        self.analyses.insert(&analysis)?;
        info!(analysis_id = %analysis.id, total_tokens, total_cost, "analysis persisted");

        if let (Some(hook), Some(eval_ids)) = (&self.evaluation_hook, &input.post_eval_ids) {
            if let Err(e) = hook.dispatch(&parent.id, Some(&analysis.id), eval_ids).await {
                warn!(error = %e, "evaluation hook failed; pipeline result unaffected");
            }
        }

        Ok(analysis)
    }

    /// Retries a stage call up to `max_retries` times on `TransientError` or
    /// `Timeout`, with exponential jittered backoff starting at 250ms (spec
    /// §4.5 step 2d, §5). Each attempt is bounded by `config.stage_timeout_ms`
    /// and raced against `cancel`.
    async fn run_stage_with_retry(
        &self,
        catalog_entry: &crate::catalog::CatalogEntry,
        request: &ExecRequest,
        stage_num: u8,
        tenant: &str,
        project: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(crate::provider::ExecResult, u32)> {
        let max_retries = self.config.provider_config(catalog_entry.provider).max_retries;
        let stage_timeout = Duration::from_millis(self.config.stage_timeout_ms);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (api_key, handle) = self.credentials.resolve(tenant, catalog_entry.provider, project)?;

            let call = self.client.execute(
                catalog_entry.provider,
                &api_key,
                request,
                &catalog_entry.parameter_profile,
                catalog_entry.pricing,
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                res = tokio::time::timeout(stage_timeout, call) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::timeout(stage_timeout.as_millis() as u64)),
                },
            };
            if self.credentials.mark_used(&handle).is_err() {
                warn!("credential mark_used failed; continuing");
            }

            match outcome {
                Ok(result) => return Ok((result, attempt)),
                Err(e @ (Error::TransientError { .. } | Error::Timeout { .. })) if attempt <= max_retries => {
                    let backoff = backoff_with_jitter(attempt);
                    warn!(stage = stage_num, attempt, backoff_ms = backoff.as_millis() as u64, error = %e, "retryable error, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// `250ms * 2^(attempt-1)` with +/-50% jitter (spec §4.5: "exponential
/// backoff starting at 250 ms, jittered").
fn backoff_with_jitter(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << (attempt.saturating_sub(1)));
    let jitter_factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base_ms as f64 * jitter_factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::credential::CredentialVault;
    use crate::pipeline::types::StageConfig;
    use crate::provider::{LLMClient, MultiProviderClient, ParameterProfile, Pricing, Provider, StopReason, TokenUsage};
    use async_trait::async_trait;

    #[test]
    fn backoff_grows_exponentially_in_expectation() {
        let b1 = backoff_with_jitter(1).as_millis();
        let b2 = backoff_with_jitter(2).as_millis();
        // Jittered, but bounds are [125,375) then [250,750) — sanity check ranges.
        assert!((125..375).contains(&b1));
        assert!((250..750).contains(&b2));
    }

    struct SlowClient {
        delay: Duration,
    }

    #[async_trait]
    impl LLMClient for SlowClient {
        async fn execute(
            &self,
            _api_key: &str,
            _request: &ExecRequest,
            _profile: &ParameterProfile,
            pricing: Pricing,
        ) -> Result<crate::provider::ExecResult> {
            tokio::time::sleep(self.delay).await;
            let usage = TokenUsage { input_tokens: 1, output_tokens: 1 };
            let (input_cost, output_cost, total_cost) = pricing.cost(usage);
            Ok(crate::provider::ExecResult {
                content: "stage output".to_string(),
                usage,
                input_cost,
                output_cost,
                total_cost,
                duration_ms: 1,
                finish_reason: StopReason::Stop,
                model_version: "m-cheap-2024-01".to_string(),
                provider_request_id: None,
            })
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn test_engine(delay: Duration, stage_timeout_ms: u64) -> PipelineEngine {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([7u8; 32]).unwrap());
        credentials.store("acme", None, Provider::Anthropic, "sk-test", true).unwrap();
        let client = Arc::new(MultiProviderClient::new().with_client(Provider::Anthropic, Arc::new(SlowClient { delay })));
        let traces = Arc::new(TraceRecorder::in_memory().unwrap());
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        let mut config = Config::default();
        config.stage_timeout_ms = stage_timeout_ms;
        config.providers.insert(
            Provider::Anthropic,
            crate::config::ProviderConfig {
                base_url: Provider::Anthropic.default_base_url().to_string(),
                request_timeout_ms: 120_000,
                max_retries: 0,
            },
        );
        PipelineEngine::new(catalog, credentials, client, traces, analyses, Arc::new(config))
    }

    fn sample_input() -> PipelineInput {
        let stage = StageConfig {
            model_name: "m-cheap".to_string(),
            system_prompt: "do the thing".to_string(),
            params: StageParams::new(0.2, 0.9, 512),
        };
        PipelineInput {
            transcript: "Customer reports order #42 is late.".to_string(),
            title: None,
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            project: None,
            redact_pii: false,
            stage_config: [stage.clone(), stage.clone(), stage],
            post_eval_ids: None,
        }
    }

    #[tokio::test]
    async fn stage_call_exceeding_timeout_fails_without_analysis() {
        let engine = test_engine(Duration::from_millis(80), 10);
        let err = engine.run(sample_input(), CancellationToken::new()).await.unwrap_err();
        match err {
            Error::PipelineError { stage, message } => {
                assert_eq!(stage, 1);
                assert!(message.contains("timed out"));
            }
            other => panic!("expected PipelineError wrapping a timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pre_cancelled_token_aborts_before_any_stage_runs() {
        let engine = test_engine(Duration::from_millis(5), 5_000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.run(sample_input(), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn cancellation_mid_call_aborts_the_stage() {
        let engine = test_engine(Duration::from_millis(200), 5_000);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let err = engine.run(sample_input(), cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
