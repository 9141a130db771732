//! Judge Engine (C6) — blind per-stage evaluation plus overall verdict
//! (spec §4.6).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::catalog::ModelCatalog;
use crate::comparison::guard::DuplicateGuard;
use crate::comparison::store::ComparisonStore;
use crate::config::Config;
use crate::credential::CredentialVault;
use crate::error::{Error, Result};
use crate::judge::aggregate;
use crate::judge::parser::parse_with_repair;
use crate::judge::types::{Comparison, ComparisonInput, ComparisonMetadata, StageVerdict, Winner};
use crate::pipeline::store::AnalysisStore;
use crate::pipeline::types::Analysis;
use crate::provider::{ChatMessage, ExecRequest, ExecResult, MultiProviderClient};
use crate::trace::{SpanType, Status, TraceRecorder, TraceSource};

const MIN_STAGE_MAX_TOKENS: u32 = 3000;
const MIN_OVERALL_MAX_TOKENS: u32 = 4000;
const RETRY_BUDGET_MULTIPLIER: f64 = 1.25;
const STRICT_JSON_PREFIX: &str = "Respond with valid JSON only, matching the schema exactly. ";

pub struct JudgeEngine {
    catalog: Arc<ModelCatalog>,
    credentials: Arc<CredentialVault>,
    client: Arc<MultiProviderClient>,
    traces: Arc<TraceRecorder>,
    analyses: Arc<AnalysisStore>,
    comparisons: Arc<ComparisonStore>,
    guard: Arc<DuplicateGuard>,
    config: Arc<Config>,
}

/// Which blind label (`A`/`B`) an actual analysis id maps to for this run.
struct BlindMapping {
    label_a_analysis: Analysis,
    label_b_analysis: Analysis,
}

impl JudgeEngine {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        credentials: Arc<CredentialVault>,
        client: Arc<MultiProviderClient>,
        traces: Arc<TraceRecorder>,
        analyses: Arc<AnalysisStore>,
        comparisons: Arc<ComparisonStore>,
        guard: Arc<DuplicateGuard>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            catalog,
            credentials,
            client,
            traces,
            analyses,
            comparisons,
            guard,
            config,
        }
    }

    #[instrument(skip(self, input, cancel), fields(tenant = %input.tenant))]
    pub async fn run(&self, input: ComparisonInput, cancel: CancellationToken) -> Result<Comparison> {
        if input.analysis_a_id == input.analysis_b_id {
            return Err(Error::SameAnalysis(input.analysis_a_id.clone()));
        }
        if input.evaluation_criteria.is_empty() {
            return Err(Error::Config("evaluation_criteria must be non-empty".into()));
        }

        let analysis_a = self
            .analyses
            .get(&input.analysis_a_id)?
            .ok_or_else(|| Error::unknown_model(format!("analysis {}", input.analysis_a_id)))?;
        let analysis_b = self
            .analyses
            .get(&input.analysis_b_id)?
            .ok_or_else(|| Error::unknown_model(format!("analysis {}", input.analysis_b_id)))?;

        if analysis_a.tenant != input.tenant || analysis_b.tenant != input.tenant {
            return Err(Error::CrossTenant {
                a_tenant: analysis_a.tenant.clone(),
                b_tenant: analysis_b.tenant.clone(),
            });
        }
        if analysis_a.transcript_input != analysis_b.transcript_input {
            return Err(Error::TranscriptMismatch {
                a: input.analysis_a_id.clone(),
                b: input.analysis_b_id.clone(),
            });
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Contention on the advisory lock itself resolves to DuplicateConflict
        // once the winner's comparison row appears, not Error::Internal.
        let _lease = self
            .acquire_guard_lease(&input.tenant, &input.analysis_a_id, &input.analysis_b_id, &input.judge_model)
            .await?;
        if let Some(existing) = self.comparisons.find_existing(
            &input.tenant,
            &input.analysis_a_id,
            &input.analysis_b_id,
            &input.judge_model,
        )? {
            return Err(Error::duplicate_conflict(existing.id));
        }

        let catalog_entry = self.catalog.lookup(&input.judge_model)?;

        // Blind relabeling: which physical analysis is shown as "A" to the
        // judge is randomized per run and never leaks outside this function.
        let swap = rand::thread_rng().gen_bool(0.5);
        let mapping = if swap {
            BlindMapping {
                label_a_analysis: analysis_b.clone(),
                label_b_analysis: analysis_a.clone(),
            }
        } else {
            BlindMapping {
                label_a_analysis: analysis_a.clone(),
                label_b_analysis: analysis_b.clone(),
            }
        };

        let parent = self.traces.open_parent(
            TraceSource::Judge,
            "judge_run",
            &input.tenant,
            &input.creator,
            None,
        )?;

        let mut clamped_fields: Vec<String> = Vec::new();
        let mut total_duration_ms: u64 = 0;

        macro_rules! run_call {
            ($stage_name:expr, $max_tokens:expr, $a_text:expr, $b_text:expr, $extra_context:expr) => {{
                let span = self.traces.open_span(
                    &parent,
                    $stage_name,
                    SpanType::Llm,
                    Some(&input.judge_model),
                    serde_json::json!({ "call": $stage_name }),
                )?;
                let result = self
                    .run_judge_call(
                        &catalog_entry,
                        &input,
                        $stage_name,
                        $max_tokens,
                        $a_text,
                        $b_text,
                        $extra_context,
                        &cancel,
                    )
                    .await;
                match result {
                    Ok((exec_result, verdict, mut fields)) => {
                        clamped_fields.append(&mut fields);
                        total_duration_ms += exec_result.duration_ms;
                        self.traces.close_span_ok(&span, &exec_result, 1)?;
                        verdict
                    }
                    Err(e) => {
                        let status = match &e {
                            Error::Timeout { .. } => Status::Timeout,
                            Error::Cancelled => Status::Cancelled,
                            _ => Status::Error,
                        };
                        self.traces.close_span_failed(&span, status, 1)?;
                        self.traces.close_parent(&parent, status)?;
                        return Err(e);
                    }
                }
            }};
        }

        let stage1 = run_call!(
            "call_stage1",
            MIN_STAGE_MAX_TOKENS,
            &mapping.label_a_analysis.facts_output,
            &mapping.label_b_analysis.facts_output,
            None
        );
        let stage2 = run_call!(
            "call_stage2",
            MIN_STAGE_MAX_TOKENS,
            &mapping.label_a_analysis.insights_output,
            &mapping.label_b_analysis.insights_output,
            None
        );
        let stage3 = run_call!(
            "call_stage3",
            MIN_STAGE_MAX_TOKENS,
            &mapping.label_a_analysis.summary_output,
            &mapping.label_b_analysis.summary_output,
            None
        );

        let overall_context = format!(
            "Stage 1 verdict: winner={:?} reasoning={}\nStage 2 verdict: winner={:?} reasoning={}\nStage 3 verdict: winner={:?} reasoning={}",
            stage1.winner, stage1.reasoning, stage2.winner, stage2.reasoning, stage3.winner, stage3.reasoning,
        );
        let overall_a = format!(
            "{}\n\n{}\n\n{}",
            mapping.label_a_analysis.facts_output, mapping.label_a_analysis.insights_output, mapping.label_a_analysis.summary_output
        );
        let overall_b = format!(
            "{}\n\n{}\n\n{}",
            mapping.label_b_analysis.facts_output, mapping.label_b_analysis.insights_output, mapping.label_b_analysis.summary_output
        );
        let overall = run_call!(
            "call_overall",
            MIN_OVERALL_MAX_TOKENS,
            &overall_a,
            &overall_b,
            Some(overall_context.as_str())
        );

        self.traces.close_parent(&parent, Status::Ok)?;

        let weights = self.config.pipeline_stage_weights;
        let (weighted_a, weighted_b) = aggregate::weighted_overall(&stage1, &stage2, &stage3, weights);
        let implied = aggregate::implied_winner(weighted_a, weighted_b);
        if implied != overall.winner {
            warn!(
                judge_winner = ?overall.winner,
                implied_winner = ?implied,
                "judge_overall_disagrees_with_implied"
            );
            self.traces.link_metadata(
                &parent,
                serde_json::json!({ "warning": "judge_overall_disagrees_with_implied" }),
            )?;
        }
        if !clamped_fields.is_empty() {
            self.traces
                .link_metadata(&parent, serde_json::json!({ "clamped_fields": clamped_fields }))?;
        }

        let quality_improvement = aggregate::quality_improvement(weighted_a, weighted_b, overall.winner);

        // cost_a/cost_b refer to the physical analyses (not blind labels):
        // always analysis_a/analysis_b as the caller named them, independent
        // of which label the judge saw.
        let (cost_diff, cost_diff_pct) = aggregate::cost_difference_pct(analysis_a.total_cost, analysis_b.total_cost);
        let _ = cost_diff;

        let comparison = Comparison {
            id: ComparisonStore::new_id(),
            tenant: input.tenant.clone(),
            creator: input.creator.clone(),
            analysis_a: input.analysis_a_id.clone(),
            analysis_b: input.analysis_b_id.clone(),
            judge_model: input.judge_model.clone(),
            judge_model_version: catalog_entry.model_version.clone(),
            judge_temperature: input.judge_temperature,
            evaluation_criteria: input.evaluation_criteria.clone(),
            stage1,
            stage2,
            stage3,
            overall,
            judge_trace_id: parent.id.clone(),
            comparison_metadata: ComparisonMetadata {
                cost_a: analysis_a.total_cost,
                cost_b: analysis_b.total_cost,
                tokens_a: analysis_a.total_tokens,
                tokens_b: analysis_b.total_tokens,
                total_cost: analysis_a.total_cost + analysis_b.total_cost,
                duration_ms: total_duration_ms,
                cost_difference_pct: cost_diff_pct,
                quality_improvement_pct: quality_improvement,
                implied_winner: implied,
                clamped_fields,
            },
            created_at: Utc::now(),
        };

        self.comparisons.insert(&comparison)?;
        info!(comparison_id = %comparison.id, "comparison persisted");
        Ok(comparison)
    }

    /// Polls for the advisory lock, bounded by `overall_judge_timeout_ms`.
    /// Contention resolves to `DuplicateConflict` as soon as the winner's
    /// comparison row becomes visible; if the deadline passes with neither
    /// the lock freed nor a comparison persisted, the contention is a
    /// genuine stuck-lease condition and surfaces as `Error::Internal`.
    async fn acquire_guard_lease(
        &self,
        tenant: &str,
        analysis_a_id: &str,
        analysis_b_id: &str,
        judge_model: &str,
    ) -> Result<crate::comparison::guard::GuardLease> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.config.overall_judge_timeout_ms);
        loop {
            match self.guard.acquire(tenant, analysis_a_id, analysis_b_id, judge_model) {
                Ok(lease) => return Ok(lease),
                Err(_) => {
                    if let Some(existing) =
                        self.comparisons.find_existing(tenant, analysis_a_id, analysis_b_id, judge_model)?
                    {
                        return Err(Error::duplicate_conflict(existing.id));
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Internal(format!(
                            "duplicate judge run contention for ({analysis_a_id}, {analysis_b_id}, {judge_model}) did not resolve to a persisted comparison"
                        )));
                    }
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_judge_call(
        &self,
        catalog_entry: &crate::catalog::CatalogEntry,
        input: &ComparisonInput,
        call_name: &str,
        max_tokens: u32,
        a_text: &str,
        b_text: &str,
        extra_context: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(ExecResult, StageVerdict, Vec<String>)> {
        let system_prompt = judge_system_prompt(&input.evaluation_criteria);
        let user_prompt = judge_user_prompt(a_text, b_text, extra_context);

        let raw = self
            .execute_judge_prompt(catalog_entry, input, call_name, &system_prompt, &user_prompt, max_tokens, cancel)
            .await?;

        match parse_with_repair(&raw.content, call_name) {
            Ok(parsed) => Ok((raw, parsed.verdict, parsed.clamped_fields)),
            Err(_) => {
                // Step 5: retry the whole call once with a stricter prompt
                // and a larger token budget.
                let stricter_system = format!("{STRICT_JSON_PREFIX}{system_prompt}");
                let retried_max_tokens = (max_tokens as f64 * RETRY_BUDGET_MULTIPLIER) as u32;
                let retry_raw = self
                    .execute_judge_prompt(
                        catalog_entry,
                        input,
                        call_name,
                        &stricter_system,
                        &user_prompt,
                        retried_max_tokens,
                        cancel,
                    )
                    .await?;
                match parse_with_repair(&retry_raw.content, call_name) {
                    Ok(parsed) => Ok((retry_raw, parsed.verdict, parsed.clamped_fields)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_judge_prompt(
        &self,
        catalog_entry: &crate::catalog::CatalogEntry,
        input: &ComparisonInput,
        call_name: &str,
        system_prompt: &str,
        user_prompt: &str,
        max_tokens: u32,
        cancel: &CancellationToken,
    ) -> Result<ExecResult> {
        let request = ExecRequest::new(
            input.judge_model.clone(),
            vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)],
        )
        .with_temperature(input.judge_temperature)
        .with_max_tokens(max_tokens);

        let call_timeout = if call_name == "call_overall" {
            Duration::from_millis(self.config.overall_judge_timeout_ms)
        } else {
            Duration::from_millis(self.config.stage_timeout_ms)
        };

        let max_retries = self.config.provider_config(catalog_entry.provider).max_retries;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let (api_key, handle) = self.credentials.resolve(&input.tenant, catalog_entry.provider, None)?;
            let call = self.client.execute(
                catalog_entry.provider,
                &api_key,
                &request,
                &catalog_entry.parameter_profile,
                catalog_entry.pricing,
            );
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                res = tokio::time::timeout(call_timeout, call) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::timeout(call_timeout.as_millis() as u64)),
                },
            };
            if self.credentials.mark_used(&handle).is_err() {
                warn!("credential mark_used failed; continuing");
            }
            match outcome {
                Ok(result) => return Ok(result),
                Err(e @ (Error::TransientError { .. } | Error::Timeout { .. })) if attempt <= max_retries => {
                    tokio::time::sleep(judge_backoff(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn judge_backoff(attempt: u32) -> Duration {
    let base_ms = 250u64.saturating_mul(1u64 << (attempt.saturating_sub(1)));
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

fn judge_system_prompt(criteria: &[String]) -> String {
    format!(
        "You are a blind evaluator comparing two candidate outputs, labeled A and B. \
         Score each on these criteria: {}. Respond with a single JSON object: \
         {{\"winner\": \"A\"|\"B\"|\"tie\", \"scores\": {{\"A\": {{criterion: number in [0,1]}}, \
         \"B\": {{criterion: number in [0,1]}}}}, \"reasoning\": string}}. No prose outside the JSON object.",
        criteria.join(", ")
    )
}

fn judge_user_prompt(a_text: &str, b_text: &str, extra_context: Option<&str>) -> String {
    let mut prompt = format!("Candidate A:\n{a_text}\n\nCandidate B:\n{b_text}");
    if let Some(context) = extra_context {
        prompt.push_str(&format!("\n\nPrior per-stage verdicts:\n{context}"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::credential::CredentialVault;
    use crate::provider::{LLMClient, ParameterProfile, Pricing, Provider, StopReason, TokenUsage};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct ScriptedJudgeClient {
        responses: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl LLMClient for ScriptedJudgeClient {
        async fn execute(
            &self,
            _api_key: &str,
            _request: &ExecRequest,
            _profile: &ParameterProfile,
            pricing: Pricing,
        ) -> Result<ExecResult> {
            let mut responses = self.responses.lock().unwrap();
            let content = if responses.is_empty() {
                "{}".to_string()
            } else {
                responses.remove(0)
            };
            let usage = TokenUsage {
                input_tokens: 10,
                output_tokens: 10,
            };
            let (input_cost, output_cost, total_cost) = pricing.cost(usage);
            Ok(ExecResult {
                content,
                usage,
                input_cost,
                output_cost,
                total_cost,
                duration_ms: 1,
                finish_reason: StopReason::Stop,
                model_version: "m-judge-v1".to_string(),
                provider_request_id: None,
            })
        }

        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
    }

    fn setup() -> (JudgeEngine, Analysis, Analysis) {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([3u8; 32]).unwrap());
        credentials
            .store("acme", None, Provider::Anthropic, "sk-test", true)
            .unwrap();

        let verdict = serde_json::json!({
            "winner": "A",
            "scores": {
                "A": {"groundedness": 0.9, "faithfulness": 0.9, "completeness": 0.9, "clarity": 0.9, "accuracy": 0.9},
                "B": {"groundedness": 0.5, "faithfulness": 0.5, "completeness": 0.5, "clarity": 0.5, "accuracy": 0.5}
            },
            "reasoning": "A is more thorough"
        })
        .to_string();
        let responses = vec![verdict.clone(), verdict.clone(), verdict.clone(), verdict];

        let client = Arc::new(
            crate::provider::MultiProviderClient::new().with_client(
                Provider::Anthropic,
                Arc::new(ScriptedJudgeClient {
                    responses: StdMutex::new(responses),
                }),
            ),
        );

        let traces = Arc::new(TraceRecorder::in_memory().unwrap());
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        let comparisons = Arc::new(ComparisonStore::in_memory().unwrap());
        let guard = Arc::new(DuplicateGuard::new());
        let config = Arc::new(Config::default());

        let engine = JudgeEngine::new(catalog, credentials, client, traces, analyses.clone(), comparisons, guard, config);

        let mut base = sample_analysis("analysis_a", "acme");
        base.total_cost = 0.0001;
        let mut other = sample_analysis("analysis_b", "acme");
        other.total_cost = 0.00012;
        analyses.insert(&base).unwrap();
        analyses.insert(&other).unwrap();

        (engine, base, other)
    }

    fn sample_analysis(id: &str, tenant: &str) -> Analysis {
        Analysis {
            id: id.to_string(),
            tenant: tenant.to_string(),
            creator: "user-1".to_string(),
            project: None,
            transcript_title: None,
            transcript_input: "Customer reports order #42 is late.".to_string(),
            pii_redacted: false,
            facts_output: "F".to_string(),
            insights_output: "I".to_string(),
            summary_output: "S".to_string(),
            stage_params: Default::default(),
            system_prompt: ["p1".to_string(), "p2".to_string(), "p3".to_string()],
            model: ["m-cheap".to_string(), "m-cheap".to_string(), "m-cheap".to_string()],
            total_tokens: 450,
            total_cost: 0.00006,
            total_duration_ms: 30,
            parent_trace_id: "trace_abc".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn same_analysis_id_is_rejected() {
        let (engine, a, _b) = setup();
        let input = ComparisonInput {
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a_id: a.id.clone(),
            analysis_b_id: a.id.clone(),
            judge_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_temperature: 0.0,
            evaluation_criteria: crate::config::default_evaluation_criteria(),
        };
        let err = engine.run(input, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::SameAnalysis(_)));
    }

    #[tokio::test]
    async fn happy_path_produces_comparison() {
        let (engine, a, b) = setup();
        let input = ComparisonInput {
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a_id: a.id.clone(),
            analysis_b_id: b.id.clone(),
            judge_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_temperature: 0.0,
            evaluation_criteria: crate::config::default_evaluation_criteria(),
        };
        let comparison = engine.run(input, CancellationToken::new()).await.unwrap();
        assert_eq!(comparison.analysis_a, a.id);
        assert_eq!(comparison.analysis_b, b.id);
        assert!(comparison.comparison_metadata.cost_difference_pct.is_some());
    }

    #[tokio::test]
    async fn transcript_mismatch_is_rejected() {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([3u8; 32]).unwrap());
        credentials
            .store("acme", None, Provider::Anthropic, "sk-test", true)
            .unwrap();
        let client = Arc::new(crate::provider::MultiProviderClient::new());
        let traces = Arc::new(TraceRecorder::in_memory().unwrap());
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        let comparisons = Arc::new(ComparisonStore::in_memory().unwrap());
        let guard = Arc::new(DuplicateGuard::new());
        let config = Arc::new(Config::default());
        let engine = JudgeEngine::new(catalog, credentials, client, traces, analyses.clone(), comparisons, guard, config);

        let a = sample_analysis("analysis_a", "acme");
        let mut b = sample_analysis("analysis_b", "acme");
        b.transcript_input = "a different transcript".to_string();
        analyses.insert(&a).unwrap();
        analyses.insert(&b).unwrap();

        let input = ComparisonInput {
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a_id: a.id.clone(),
            analysis_b_id: b.id.clone(),
            judge_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_temperature: 0.0,
            evaluation_criteria: crate::config::default_evaluation_criteria(),
        };
        let err = engine.run(input, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::TranscriptMismatch { .. }));
    }

    #[tokio::test]
    async fn pre_cancelled_token_is_rejected_before_any_call() {
        let (engine, a, b) = setup();
        let input = ComparisonInput {
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a_id: a.id.clone(),
            analysis_b_id: b.id.clone(),
            judge_model: "claude-3-5-sonnet-20241022".to_string(),
            judge_temperature: 0.0,
            evaluation_criteria: crate::config::default_evaluation_criteria(),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.run(input, cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn lock_contention_resolves_to_duplicate_conflict_once_winner_persists() {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([3u8; 32]).unwrap());
        credentials
            .store("acme", None, Provider::Anthropic, "sk-test", true)
            .unwrap();
        let client = Arc::new(crate::provider::MultiProviderClient::new());
        let traces = Arc::new(TraceRecorder::in_memory().unwrap());
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        let comparisons = Arc::new(ComparisonStore::in_memory().unwrap());
        let guard = Arc::new(DuplicateGuard::new());
        let mut config_val = Config::default();
        config_val.overall_judge_timeout_ms = 2_000;
        let config = Arc::new(config_val);

        let a = sample_analysis("analysis_a", "acme");
        let b = sample_analysis("analysis_b", "acme");
        analyses.insert(&a).unwrap();
        analyses.insert(&b).unwrap();

        let judge_model = "claude-3-5-sonnet-20241022".to_string();

        // Simulate a concurrent racer already holding the lock for this
        // exact (tenant, pair, judge_model) scope.
        let racer_lease = guard.acquire("acme", &a.id, &b.id, &judge_model).unwrap();

        let winner_id = ComparisonStore::new_id();
        let winning_comparison = sample_comparison(&winner_id, &a.id, &b.id, &judge_model);
        let comparisons_bg = comparisons.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            comparisons_bg.insert(&winning_comparison).unwrap();
            drop(racer_lease);
        });

        let engine = JudgeEngine::new(catalog, credentials, client, traces, analyses.clone(), comparisons, guard, config);
        let input = ComparisonInput {
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a_id: a.id.clone(),
            analysis_b_id: b.id.clone(),
            judge_model,
            judge_temperature: 0.0,
            evaluation_criteria: crate::config::default_evaluation_criteria(),
        };
        let err = engine.run(input, CancellationToken::new()).await.unwrap_err();
        match err {
            Error::DuplicateConflict { existing_id } => assert_eq!(existing_id, winner_id),
            other => panic!("expected DuplicateConflict, got {other:?}"),
        }
    }

    fn sample_comparison(id: &str, a: &str, b: &str, judge_model: &str) -> Comparison {
        let verdict = StageVerdict {
            winner: Winner::A,
            scores_a: Default::default(),
            scores_b: Default::default(),
            reasoning: "A wins".to_string(),
        };
        Comparison {
            id: id.to_string(),
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            analysis_a: a.to_string(),
            analysis_b: b.to_string(),
            judge_model: judge_model.to_string(),
            judge_model_version: judge_model.to_string(),
            judge_temperature: 0.0,
            evaluation_criteria: vec!["groundedness".to_string()],
            stage1: verdict.clone(),
            stage2: verdict.clone(),
            stage3: verdict.clone(),
            overall: verdict,
            judge_trace_id: "trace_judge_1".to_string(),
            comparison_metadata: ComparisonMetadata {
                cost_a: 0.0,
                cost_b: 0.0,
                tokens_a: 0,
                tokens_b: 0,
                total_cost: 0.0,
                duration_ms: 0,
                cost_difference_pct: None,
                quality_improvement_pct: None,
                implied_winner: Winner::A,
                clamped_fields: vec![],
            },
            created_at: Utc::now(),
        }
    }
}
