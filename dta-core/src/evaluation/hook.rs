//! Evaluation Hook (C8) — bounded-concurrency dispatch of registered
//! evaluators against a completed trace/analysis (spec §4.8).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::catalog::ModelCatalog;
use crate::credential::CredentialVault;
use crate::error::{Error, Result};
use crate::evaluation::store::EvaluationResultStore;
use crate::evaluation::types::{EvaluationResult, EvaluationStatus, Evaluator};
use crate::pipeline::store::AnalysisStore;
use crate::provider::{ChatMessage, ExecRequest, MultiProviderClient};

const MAX_CONCURRENT_EVALUATORS: usize = 4;

/// Pluggable rule-based evaluator implementation, resolved by `rule_id`
/// (an external collaborator, per spec §1 Non-goals — this trait is the
/// seam it plugs into, mirroring [`crate::pipeline::types::Redactor`]).
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(&self, config: &Value, analysis: Option<&crate::pipeline::types::Analysis>) -> Result<(bool, Option<String>)>;
}

/// Pluggable opaque evaluator implementation, resolved by `implementation_ref`.
pub trait HeuristicEvaluator: Send + Sync {
    fn evaluate(&self, analysis: Option<&crate::pipeline::types::Analysis>) -> Result<(Option<f64>, Option<bool>, Option<String>)>;
}

pub struct EvaluationHook {
    catalog: Arc<ModelCatalog>,
    credentials: Arc<CredentialVault>,
    client: Arc<MultiProviderClient>,
    analyses: Arc<AnalysisStore>,
    results: Arc<EvaluationResultStore>,
    registry: HashMap<String, Evaluator>,
    rule_evaluators: HashMap<String, Arc<dyn RuleEvaluator>>,
    heuristic_evaluators: HashMap<String, Arc<dyn HeuristicEvaluator>>,
}

impl EvaluationHook {
    pub fn new(
        catalog: Arc<ModelCatalog>,
        credentials: Arc<CredentialVault>,
        client: Arc<MultiProviderClient>,
        analyses: Arc<AnalysisStore>,
        results: Arc<EvaluationResultStore>,
    ) -> Self {
        Self {
            catalog,
            credentials,
            client,
            analyses,
            results,
            registry: HashMap::new(),
            rule_evaluators: HashMap::new(),
            heuristic_evaluators: HashMap::new(),
        }
    }

    pub fn register(mut self, evaluator_id: impl Into<String>, evaluator: Evaluator) -> Self {
        self.registry.insert(evaluator_id.into(), evaluator);
        self
    }

    pub fn with_rule_evaluator(mut self, rule_id: impl Into<String>, implementation: Arc<dyn RuleEvaluator>) -> Self {
        self.rule_evaluators.insert(rule_id.into(), implementation);
        self
    }

    pub fn with_heuristic_evaluator(mut self, implementation_ref: impl Into<String>, implementation: Arc<dyn HeuristicEvaluator>) -> Self {
        self.heuristic_evaluators.insert(implementation_ref.into(), implementation);
        self
    }

    /// Dispatches every id in `evaluator_ids` with bounded concurrency (≤4).
    /// Individual evaluator failures are recorded as `status=error` rows and
    /// never fail the hook as a whole (spec §4.8).
    pub async fn dispatch(&self, trace_id: &str, analysis_id: Option<&str>, evaluator_ids: &[String]) -> Result<()> {
        let analysis = match analysis_id {
            Some(id) => self.analyses.get(id)?,
            None => None,
        };

        let outcomes: Vec<EvaluationResult> = stream::iter(evaluator_ids.iter().cloned())
            .map(|evaluator_id| {
                let trace_id = trace_id.to_string();
                let analysis = analysis.clone();
                async move { self.run_one(&trace_id, analysis.as_ref(), &evaluator_id).await }
            })
            .buffer_unordered(MAX_CONCURRENT_EVALUATORS)
            .collect()
            .await;

        for outcome in &outcomes {
            if let Err(e) = self.results.insert(outcome) {
                warn!(evaluator_id = %outcome.evaluator_id, error = %e, "failed to persist evaluation result");
            }
        }
        Ok(())
    }

    async fn run_one(
        &self,
        trace_id: &str,
        analysis: Option<&crate::pipeline::types::Analysis>,
        evaluator_id: &str,
    ) -> EvaluationResult {
        let outcome = self.evaluate(analysis, evaluator_id).await;
        let (status, score, passed, reason) = match outcome {
            Ok((score, passed, reason)) => (EvaluationStatus::Ok, score, passed, reason),
            Err(e) => (EvaluationStatus::Error, None, None, Some(e.to_string())),
        };
        EvaluationResult {
            id: EvaluationResultStore::new_id(),
            trace_id: trace_id.to_string(),
            analysis_id: analysis.map(|a| a.id.clone()),
            evaluator_id: evaluator_id.to_string(),
            status,
            score,
            passed,
            reason,
            created_at: Utc::now(),
        }
    }

    async fn evaluate(
        &self,
        analysis: Option<&crate::pipeline::types::Analysis>,
        evaluator_id: &str,
    ) -> Result<(Option<f64>, Option<bool>, Option<String>)> {
        let evaluator = self
            .registry
            .get(evaluator_id)
            .ok_or_else(|| Error::Internal(format!("unknown evaluator {evaluator_id}")))?;

        match evaluator {
            Evaluator::LLMJudge { model, criteria, threshold } => {
                self.run_llm_judge(analysis, model, criteria, *threshold).await
            }
            Evaluator::RuleBased { rule_id, config } => {
                let implementation = self
                    .rule_evaluators
                    .get(rule_id)
                    .ok_or_else(|| Error::Internal(format!("no rule evaluator registered for {rule_id}")))?;
                let (passed, reason) = implementation.evaluate(config, analysis)?;
                Ok((None, Some(passed), reason))
            }
            Evaluator::Heuristic { implementation_ref } => {
                let implementation = self
                    .heuristic_evaluators
                    .get(implementation_ref)
                    .ok_or_else(|| Error::Internal(format!("no heuristic evaluator registered for {implementation_ref}")))?;
                implementation.evaluate(analysis)
            }
        }
    }

    async fn run_llm_judge(
        &self,
        analysis: Option<&crate::pipeline::types::Analysis>,
        model: &str,
        criteria: &[String],
        threshold: f64,
    ) -> Result<(Option<f64>, Option<bool>, Option<String>)> {
        let analysis = analysis.ok_or_else(|| Error::Internal("LLMJudge evaluator requires an analysis".into()))?;
        let catalog_entry = self.catalog.lookup(model)?;

        let system_prompt = format!(
            "You are an evaluator scoring one piece of analysis output against these criteria: {}. \
             Respond with a single JSON object: {{\"score\": number in [0,1], \"reason\": string}}. \
             No prose outside the JSON object.",
            criteria.join(", ")
        );
        let user_prompt = format!(
            "Facts:\n{}\n\nInsights:\n{}\n\nSummary:\n{}",
            analysis.facts_output, analysis.insights_output, analysis.summary_output
        );
        let request = ExecRequest::new(model.to_string(), vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)])
            .with_temperature(0.0)
            .with_max_tokens(1000);

        let (api_key, handle) = self.credentials.resolve(&analysis.tenant, catalog_entry.provider, analysis.project.as_deref())?;
        let result = self
            .client
            .execute(catalog_entry.provider, &api_key, &request, &catalog_entry.parameter_profile, catalog_entry.pricing)
            .await?;
        if self.credentials.mark_used(&handle).is_err() {
            warn!("credential mark_used failed; continuing");
        }

        let parsed: Value = serde_json::from_str(result.content.trim())
            .map_err(|e| Error::Internal(format!("LLMJudge evaluator returned unparseable JSON: {e}")))?;
        let score = parsed.get("score").and_then(Value::as_f64).map(|s| s.clamp(0.0, 1.0));
        let reason = parsed.get("reason").and_then(Value::as_str).map(str::to_string);
        let passed = score.map(|s| s >= threshold);
        Ok((score, passed, reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModelCatalog;
    use crate::credential::CredentialVault;
    use crate::pipeline::types::Analysis;
    use crate::provider::{ExecResult, LLMClient, ParameterProfile, Pricing, Provider, StopReason, TokenUsage};
    use async_trait::async_trait;

    struct StubJudge;

    #[async_trait]
    impl LLMClient for StubJudge {
        async fn execute(&self, _api_key: &str, _request: &ExecRequest, _profile: &ParameterProfile, pricing: Pricing) -> Result<ExecResult> {
            let usage = TokenUsage { input_tokens: 5, output_tokens: 5 };
            let (input_cost, output_cost, total_cost) = pricing.cost(usage);
            Ok(ExecResult {
                content: r#"{"score":0.9,"reason":"solid"}"#.to_string(),
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

    struct AlwaysPass;
    impl RuleEvaluator for AlwaysPass {
        fn evaluate(&self, _config: &Value, _analysis: Option<&Analysis>) -> Result<(bool, Option<String>)> {
            Ok((true, Some("rule satisfied".to_string())))
        }
    }

    fn sample_analysis() -> Analysis {
        Analysis {
            id: "analysis_1".to_string(),
            tenant: "acme".to_string(),
            creator: "user-1".to_string(),
            project: None,
            transcript_title: None,
            transcript_input: "t".to_string(),
            pii_redacted: false,
            facts_output: "facts".to_string(),
            insights_output: "insights".to_string(),
            summary_output: "summary".to_string(),
            stage_params: Default::default(),
            system_prompt: ["p".to_string(), "p".to_string(), "p".to_string()],
            model: ["m-cheap".to_string(), "m-cheap".to_string(), "m-cheap".to_string()],
            total_tokens: 100,
            total_cost: 0.00001,
            total_duration_ms: 10,
            parent_trace_id: "trace_1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_runs_llm_judge_and_rule_based_concurrently() {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([7u8; 32]).unwrap());
        credentials.store("acme", None, Provider::Anthropic, "sk-test", true).unwrap();
        let client = Arc::new(crate::provider::MultiProviderClient::new().with_client(Provider::Anthropic, Arc::new(StubJudge)));
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        analyses.insert(&sample_analysis()).unwrap();
        let results = Arc::new(EvaluationResultStore::in_memory().unwrap());

        let hook = EvaluationHook::new(catalog, credentials, client, analyses, results.clone())
            .register(
                "groundedness-judge",
                Evaluator::LLMJudge {
                    model: "claude-3-5-sonnet-20241022".to_string(),
                    criteria: vec!["groundedness".to_string()],
                    threshold: 0.5,
                },
            )
            .register(
                "length-rule",
                Evaluator::RuleBased {
                    rule_id: "min-length".to_string(),
                    config: serde_json::json!({ "min_chars": 1 }),
                },
            )
            .with_rule_evaluator("min-length", Arc::new(AlwaysPass));

        hook.dispatch("trace_1", Some("analysis_1"), &["groundedness-judge".to_string(), "length-rule".to_string()])
            .await
            .unwrap();

        let stored = results.for_trace("trace_1").unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.status == EvaluationStatus::Ok));
    }

    #[tokio::test]
    async fn unknown_evaluator_is_recorded_as_error_not_fatal() {
        let catalog = Arc::new(ModelCatalog::with_well_known_models());
        let credentials = Arc::new(CredentialVault::in_memory([7u8; 32]).unwrap());
        let client = Arc::new(crate::provider::MultiProviderClient::new());
        let analyses = Arc::new(AnalysisStore::in_memory().unwrap());
        let results = Arc::new(EvaluationResultStore::in_memory().unwrap());
        let hook = EvaluationHook::new(catalog, credentials, client, analyses, results.clone());

        hook.dispatch("trace_2", None, &["does-not-exist".to_string()]).await.unwrap();

        let stored = results.for_trace("trace_2").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].status, EvaluationStatus::Error);
    }
}
