//! End-to-end tests of the agent loop over scripted backends.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use skein_core::config::{AgentConfig, RetrievalConfig};
use skein_core::llm::{CompletionRequest, LlmClient};
use skein_core::retrieval::{
    KeywordIndex, MetadataFilter, ScoredDocument, SearchScope, VectorIndex, WeightedTerm,
};
use skein_core::tokens::default_tokenizer;
use skein_core::{Agent, AgentBackends, Result, SkeinError, TurnOutput, TurnRequest};

/// Routes completions by step (recognized from the system prompt) and
/// counts the calls each step makes.
struct ScriptedLlm {
    plan: String,
    judge: String,
    answer: String,
    planner_calls: AtomicUsize,
    judge_calls: AtomicUsize,
    synthesizer_calls: AtomicUsize,
    rewrite_calls: AtomicUsize,
}

impl ScriptedLlm {
    fn new(plan: &str, judge: &str, answer: &str) -> Arc<Self> {
        Arc::new(Self {
            plan: plan.to_string(),
            judge: judge.to_string(),
            answer: answer.to_string(),
            planner_calls: AtomicUsize::new(0),
            judge_calls: AtomicUsize::new(0),
            synthesizer_calls: AtomicUsize::new(0),
            rewrite_calls: AtomicUsize::new(0),
        })
    }

    fn retrieval_plan() -> String {
        json!({
            "tool_calls": [{
                "name": "document_retriever",
                "args": {
                    "semantic_query": "advisor requirements",
                    "keyword_query": "advisor requirements"
                }
            }]
        })
        .to_string()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let system = request.system.unwrap_or_default();
        if system.starts_with("Plan the appropriate") {
            self.planner_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.plan.clone())
        } else if system.starts_with("You are capable of making tool calls") {
            self.judge_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.judge.clone())
        } else if system.starts_with("Rewrite the current user message") {
            self.rewrite_calls.fetch_add(1, Ordering::SeqCst);
            Ok("rewritten query".to_string())
        } else if system.contains("research assistant") {
            self.synthesizer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        } else {
            // Memory compressors
            Ok("compressed summary".to_string())
        }
    }
}

fn doc(id: &str, score: f64) -> ScoredDocument {
    ScoredDocument {
        id: id.to_string(),
        text: format!("content of {}", id),
        metadata: HashMap::new(),
        score,
    }
}

fn collect_nin(filter: &MetadataFilter) -> Vec<String> {
    match filter {
        MetadataFilter::NotIn(_, ids) => ids.clone(),
        MetadataFilter::And(parts) | MetadataFilter::Or(parts) => {
            parts.iter().flat_map(collect_nin).collect()
        }
        _ => Vec::new(),
    }
}

/// Serves from a pool, honoring exclusion, and records the exclusion
/// set of every call.
struct RecordingVector {
    pool: Vec<ScoredDocument>,
    excludes_seen: Mutex<Vec<Vec<String>>>,
    calls: AtomicUsize,
}

impl RecordingVector {
    fn new(pool: Vec<ScoredDocument>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            excludes_seen: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl VectorIndex for RecordingVector {
    async fn search(
        &self,
        _query: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let excluded = collect_nin(filter);
        self.excludes_seen.lock().unwrap().push(excluded.clone());
        Ok(self
            .pool
            .iter()
            .filter(|d| !excluded.contains(&d.id))
            .take(top_k)
            .cloned()
            .collect())
    }
}

struct EmptyKeyword;

#[async_trait]
impl KeywordIndex for EmptyKeyword {
    async fn search(
        &self,
        _terms: &[WeightedTerm],
        _top_k: usize,
        _scope: &SearchScope,
        _exclude: &[String],
    ) -> Result<Vec<ScoredDocument>> {
        Ok(Vec::new())
    }
}

fn config(max_iterations: usize, streaming: bool) -> AgentConfig {
    AgentConfig {
        context_window: 32_000,
        reserved_tokens: 100,
        max_iterations,
        streaming,
        rewrite_query: true,
        max_tool_calls: 2,
        planner_retries: 3,
        judge_retries: 2,
        retrieval: RetrievalConfig {
            top_k: 10,
            reranker_top_n: 5,
            reranker_backup_top_n: 10,
            branch_timeout_ms: 5_000,
            tool_timeout_ms: 30_000,
            shared_corpus: "shared".to_string(),
        },
    }
}

fn agent(llm: Arc<ScriptedLlm>, vector: Arc<RecordingVector>, cfg: AgentConfig) -> Agent {
    Agent::new(
        cfg,
        AgentBackends {
            llm,
            tokenizer: default_tokenizer(),
            vector,
            keyword: Arc::new(EmptyKeyword),
            rerank: None,
        },
    )
}

async fn answer_of(output: TurnOutput) -> String {
    match output {
        TurnOutput::Answer(text) => text,
        TurnOutput::Stream(stream) => stream.collect().await,
    }
}

#[tokio::test]
async fn test_iteration_bound_and_single_synthesis() {
    // Judge never satisfied: the loop must stop at the cap anyway
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "No", "final answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1), doc("d2", -0.2), doc("d3", -0.3)]);
    let mut agent = agent(llm.clone(), vector, config(3, false));

    let output = agent
        .turn(TurnRequest::new("What are the advisor requirements?"))
        .await
        .unwrap();

    assert_eq!(answer_of(output).await, "final answer");
    assert_eq!(llm.planner_calls.load(Ordering::SeqCst), 3);
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 1);
    // The final round skips judging
    assert_eq!(llm.judge_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_zero_call_plan_still_synthesizes() {
    let llm = ScriptedLlm::new(r#"{"tool_calls": []}"#, "No", "answer without evidence");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let vector_probe = vector.clone();
    let mut agent = agent(llm.clone(), vector, config(1, false));

    let output = agent.turn(TurnRequest::new("hello there")).await.unwrap();
    let answer = answer_of(output).await;

    assert!(!answer.is_empty());
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 1);
    // No tool call was planned, so no search ran
    assert_eq!(vector_probe.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_judge_sufficient_stops_early() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "Yes", "early answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let mut agent = agent(llm.clone(), vector, config(5, false));

    agent.turn(TurnRequest::new("question")).await.unwrap();

    assert_eq!(llm.planner_calls.load(Ordering::SeqCst), 1);
    assert_eq!(llm.judge_calls.load(Ordering::SeqCst), 1);
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_malformed_judge_defaults_to_continue() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "Perhaps", "answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let mut agent = agent(llm.clone(), vector, config(2, false));

    agent.turn(TurnRequest::new("question")).await.unwrap();

    // A verdict that never parses keeps the loop going to the cap
    assert_eq!(llm.planner_calls.load(Ordering::SeqCst), 2);
    // judge_retries attempts on the one non-final iteration
    assert_eq!(llm.judge_calls.load(Ordering::SeqCst), 2);
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_planner_failure_still_answers() {
    let llm = ScriptedLlm::new("no json here at all", "No", "fallback answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let mut agent = agent(llm.clone(), vector, config(3, false));

    let output = agent.turn(TurnRequest::new("question")).await.unwrap();

    assert_eq!(answer_of(output).await, "fallback answer");
    // planner_retries + 1 attempts, then straight to synthesis
    assert_eq!(llm.planner_calls.load(Ordering::SeqCst), 4);
    assert_eq!(llm.judge_calls.load(Ordering::SeqCst), 0);
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dedup_across_iterations() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "No", "answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1), doc("d2", -0.2)]);
    let vector_probe = vector.clone();
    let mut agent = agent(llm, vector, config(2, false));

    agent.turn(TurnRequest::new("question")).await.unwrap();

    let excludes = vector_probe.excludes_seen.lock().unwrap();
    assert_eq!(excludes.len(), 2);
    // First call excludes nothing; the second excludes what the first
    // returned
    assert!(excludes[0].is_empty());
    assert!(excludes[1].contains(&"d1".to_string()));
    assert!(excludes[1].contains(&"d2".to_string()));
}

#[tokio::test]
async fn test_seen_ids_reset_between_turns() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "Yes", "answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let vector_probe = vector.clone();
    let mut agent = agent(llm, vector, config(1, false));

    agent.turn(TurnRequest::new("first question")).await.unwrap();
    agent.turn(TurnRequest::new("second question")).await.unwrap();

    let excludes = vector_probe.excludes_seen.lock().unwrap();
    // Each turn starts with a cleared exclusion set
    assert!(excludes[0].is_empty());
    assert!(excludes[1].is_empty());
}

#[tokio::test]
async fn test_invalid_search_mode_rejected_before_any_call() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "Yes", "answer");
    let vector = RecordingVector::new(vec![]);
    let mut agent = agent(llm.clone(), vector, config(1, false));

    let err = agent
        .turn(TurnRequest::new("q").with_search_mode(1, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SkeinError::InvalidInput(_)));
    assert_eq!(llm.planner_calls.load(Ordering::SeqCst), 0);
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 0);

    let err = agent
        .turn(TurnRequest::new("q").with_search_mode(7, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, SkeinError::InvalidInput(_)));
}

#[tokio::test]
async fn test_previous_answer_committed_on_next_turn() {
    let llm = ScriptedLlm::new(r#"{"tool_calls": []}"#, "Yes", "the first answer");
    let vector = RecordingVector::new(vec![]);
    let mut agent = agent(llm, vector, config(1, false));

    agent.turn(TurnRequest::new("first question")).await.unwrap();
    // The answer is not committed until the next message arrives
    assert!(!agent.conversation().history_str().contains("the first answer"));

    agent.turn(TurnRequest::new("second question")).await.unwrap();
    let history = agent.conversation().history_str();
    assert!(history.contains("first question"));
    assert!(history.contains("the first answer"));
    assert!(history.contains("second question"));
}

#[tokio::test]
async fn test_streaming_turn_commits_after_drain() {
    let llm = ScriptedLlm::new(r#"{"tool_calls": []}"#, "Yes", "streamed answer");
    let vector = RecordingVector::new(vec![]);
    let mut agent = agent(llm, vector, config(1, true));

    let output = agent.turn(TurnRequest::new("first question")).await.unwrap();
    let text = answer_of(output).await;
    assert_eq!(text, "streamed answer");

    agent.turn(TurnRequest::new("second question")).await.unwrap();
    assert!(agent.conversation().history_str().contains("streamed answer"));
}

#[tokio::test]
async fn test_intermediate_channel_receives_non_final_rounds() {
    let llm = ScriptedLlm::new(&ScriptedLlm::retrieval_plan(), "No", "round answer");
    let vector = RecordingVector::new(vec![doc("d1", -0.1)]);
    let mut agent = agent(llm.clone(), vector, config(3, false));
    let mut intermediate = agent.intermediate_channel(8);

    agent.turn(TurnRequest::new("question")).await.unwrap();

    let mut received = 0;
    while intermediate.try_recv().is_ok() {
        received += 1;
    }
    // Two non-final iterations emitted an intermediate answer
    assert_eq!(received, 2);
    // Intermediate synthesis + the final one
    assert_eq!(llm.synthesizer_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_reset_clears_conversation() {
    let llm = ScriptedLlm::new(r#"{"tool_calls": []}"#, "Yes", "answer");
    let vector = RecordingVector::new(vec![]);
    let mut agent = agent(llm, vector, config(1, false));

    agent.turn(TurnRequest::new("question")).await.unwrap();
    assert!(!agent.conversation().is_empty());

    agent.reset();
    assert!(agent.conversation().is_empty());
}

#[tokio::test]
async fn test_seed_conversation_pairs_turns() {
    let llm = ScriptedLlm::new(r#"{"tool_calls": []}"#, "Yes", "answer");
    let vector = RecordingVector::new(vec![]);
    let mut agent = agent(llm, vector, config(1, false));

    agent.seed_conversation(&[
        ("user".to_string(), "old question".to_string()),
        ("bot".to_string(), "old answer".to_string()),
        ("system".to_string(), "ignored".to_string()),
    ]);

    let history = agent.conversation().history_str();
    assert!(history.contains("old question"));
    assert!(history.contains("old answer"));
    assert!(!history.contains("ignored"));
}
