use crate::assemble::assemble;
use crate::cache::{answer_cache_key, CacheStore};
use crate::memory::ConversationMemory;
use crate::prompt::build_prompt;
use crate::reasoning::{
    build_synthesis_prompt, cluster_themes, detect_contradictions, ReasoningState, ReasoningTrace,
};
use desk_backends::{dispatch, generate_on, BackendError, BackendRegistry, Generation, GenerationBackend};
use desk_confidence::{cluster_representative, highest_confidence, recompose, similarity_clusters, weighted_vote, ConfidenceScorer};
use desk_protocol::config::ConsensusStrategy;
use desk_protocol::{
    AnswerEvent, Citation, ComplexityClass, ConfidenceReport, ConversationTurn, FinalAnswer,
    GenerationParams, HealthSnapshot, ModelTier, Query, QueryHints, QuestionType,
    RetrievalCandidate, Role, SubRequest, SubResponse,
};
use desk_retrieval::{
    candidates_from_web, ChunkIndex, Decomposer, HybridRetriever, QueryClassifier, QueryEmbedder,
    RetrievalError, WebSearch,
};
use desk_protocol::OrchestratorConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

const CITATION_SNIPPET_CHARS: usize = 160;

struct SubOutcome {
    response: SubResponse,
    candidates: Vec<RetrievalCandidate>,
    notices: Vec<String>,
}

/// The confidence-scored hybrid retrieval and multi-instance reasoning
/// pipeline. One instance serves many concurrent queries; all shared state
/// lives behind the registry, the cache and the per-session memory.
pub struct Orchestrator {
    cfg: OrchestratorConfig,
    classifier: QueryClassifier,
    decomposer: Decomposer,
    scorer: ConfidenceScorer,
    retriever: HybridRetriever,
    registry: Arc<BackendRegistry>,
    backend: Arc<dyn GenerationBackend>,
    web: Option<Arc<dyn WebSearch>>,
    cache: Arc<dyn CacheStore>,
    memory: ConversationMemory,
    cache_hits: AtomicU64,
    cache_lookups: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        index: Arc<dyn ChunkIndex>,
        embedder: Arc<dyn QueryEmbedder>,
        backend: Arc<dyn GenerationBackend>,
        registry: Arc<BackendRegistry>,
        web: Option<Arc<dyn WebSearch>>,
        cache: Arc<dyn CacheStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            classifier: QueryClassifier::new(cfg.classifier.clone()),
            decomposer: Decomposer::new(cfg.decompose.clone()),
            scorer: ConfidenceScorer::new(cfg.confidence.clone()),
            retriever: HybridRetriever::new(index, embedder, cfg.fusion.clone()),
            memory: ConversationMemory::new(cfg.memory.clone()),
            registry,
            backend,
            web,
            cache,
            cache_hits: AtomicU64::new(0),
            cache_lookups: AtomicU64::new(0),
            cfg,
        })
    }

    /// Answer a query as a stream of events. The stream always terminates
    /// with `Done`; dropping the receiver cancels the in-flight work
    /// cooperatively.
    pub fn answer(self: &Arc<Self>, query: Query) -> mpsc::Receiver<AnswerEvent> {
        let (tx, rx) = mpsc::channel(64);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run(query, tx).await;
        });
        rx
    }

    /// Operational snapshot for the `health()` surface.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let instances = self.registry.snapshot();
        let avg_latency_ms = if instances.is_empty() {
            0.0
        } else {
            instances.iter().map(|i| i.avg_latency_ms).sum::<f64>() / instances.len() as f64
        };
        let lookups = self.cache_lookups.load(Ordering::Relaxed);
        let cache_hit_rate = if lookups == 0 {
            0.0
        } else {
            self.cache_hits.load(Ordering::Relaxed) as f64 / lookups as f64
        };
        HealthSnapshot {
            instances,
            cache_hit_rate,
            avg_latency_ms,
        }
    }

    async fn run(self: Arc<Self>, query: Query, tx: mpsc::Sender<AnswerEvent>) {
        let key = answer_cache_key(&query.text, &query.session_id, &query.hints);
        self.cache_lookups.fetch_add(1, Ordering::Relaxed);
        if let Some(value) = self.cache.get(&key).await {
            match serde_json::from_value::<FinalAnswer>(value) {
                Ok(answer) => {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Cache hit for session {}", query.session_id);
                    emit_answer(&tx, &answer).await;
                    return;
                }
                Err(err) => log::warn!("Discarding corrupt cache entry: {err}"),
            }
        }

        let (class, qtype) = self.classifier.classify_cached(&query.text);
        let sub_requests = self.decomposer.decompose(&query, class);
        log::info!(
            "Query classified {class:?}/{qtype:?}, {} sub-request(s)",
            sub_requests.len()
        );

        let mut trace = ReasoningTrace::new();
        trace.record(ReasoningState::Decomposed, 0.0);

        let (collected, mut notices) = self.fan_out(&query, &sub_requests, &tx).await;

        let mut sub_responses: Vec<SubResponse> = Vec::new();
        let mut all_candidates: Vec<RetrievalCandidate> = Vec::new();
        for outcome in collected {
            notices.extend(outcome.notices);
            all_candidates.extend(outcome.candidates);
            sub_responses.push(outcome.response);
        }

        if let Some(first) = sub_responses.iter().find(|r| !r.text.trim().is_empty()) {
            trace.record(ReasoningState::Drafting, first.confidence.composite);
        }

        let synthesized = if wants_synthesis(class, qtype) && sub_responses.len() > 1 {
            self.run_synthesis(&query, &sub_responses, &all_candidates, &mut trace, &mut notices)
                .await
        } else {
            None
        };

        let answer = assemble(
            &self.cfg.confidence,
            class,
            &sub_responses,
            synthesized,
            notices,
        );
        trace.finish(answer.confidence.composite);

        emit_answer(&tx, &answer).await;
        self.remember(&query, qtype, &answer).await;

        if !answer.degraded {
            match serde_json::to_value(&answer) {
                Ok(value) => {
                    self.cache
                        .set(&key, value, Duration::from_secs(self.cfg.cache.answer_ttl_secs))
                        .await;
                }
                Err(err) => log::warn!("Failed to serialize answer for cache: {err}"),
            }
        }
    }

    /// Process sub-requests with bounded parallelism under the end-to-end
    /// deadline. On deadline expiry in-flight tasks are cancelled and the
    /// partial results already computed are returned.
    async fn fan_out(
        self: &Arc<Self>,
        query: &Query,
        sub_requests: &[SubRequest],
        tx: &mpsc::Sender<AnswerEvent>,
    ) -> (Vec<SubOutcome>, Vec<String>) {
        let deadline = Instant::now() + Duration::from_millis(self.cfg.timeouts.end_to_end_ms);
        let semaphore = Arc::new(Semaphore::new(
            self.cfg.timeouts.sub_request_concurrency.max(1),
        ));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let mut join_set: JoinSet<(usize, Option<SubOutcome>)> = JoinSet::new();
        for (index, sub) in sub_requests.iter().enumerate() {
            let sub = sub.clone();
            let session = query.session_id.clone();
            let hints = query.hints.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel_rx.clone();
            let this = Arc::clone(self);
            join_set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, None);
                };
                if *cancel.borrow() {
                    return (index, None);
                }
                let outcome = this.process_sub_request(&sub, &session, &hints).await;
                (index, Some(outcome))
            });
        }

        let mut collected: Vec<(usize, SubOutcome)> = Vec::new();
        let mut notices: Vec<String> = Vec::new();
        loop {
            if tx.is_closed() {
                log::info!("Client disconnected; cancelling in-flight sub-requests");
                let _ = cancel_tx.send(true);
                join_set.abort_all();
                break;
            }
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((index, Some(outcome))))) => collected.push((index, outcome)),
                Ok(Some(Ok((_, None)))) => {}
                Ok(Some(Err(err))) => {
                    if !err.is_cancelled() {
                        log::warn!("Sub-request task failed: {err}");
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    log::warn!(
                        "End-to-end timeout ({}ms) elapsed; keeping partial results",
                        self.cfg.timeouts.end_to_end_ms
                    );
                    let _ = cancel_tx.send(true);
                    join_set.abort_all();
                    while let Some(res) = join_set.join_next().await {
                        if let Ok((index, Some(outcome))) = res {
                            collected.push((index, outcome));
                        }
                    }
                    notices.push(
                        "The answer timed out before every part completed; partial results are shown."
                            .to_string(),
                    );
                    break;
                }
            }
        }

        collected.sort_by_key(|(index, _)| *index);
        (
            collected.into_iter().map(|(_, outcome)| outcome).collect(),
            notices,
        )
    }

    async fn process_sub_request(
        &self,
        sub: &SubRequest,
        session_id: &str,
        hints: &QueryHints,
    ) -> SubOutcome {
        let started = std::time::Instant::now();
        let mut notices: Vec<String> = Vec::new();

        let (candidates, via_web) = match self.retriever.search(&sub.text).await {
            Ok(candidates) if candidates.is_empty() => match self.web_fallback(&sub.text).await {
                Some(web_candidates) => {
                    notices.push(format!(
                        "Answered \"{}\" from web search because the document index returned \
                         no matches.",
                        sub.text
                    ));
                    (web_candidates, true)
                }
                None => {
                    notices.push(
                        "No supporting context could be found for part of this question."
                            .to_string(),
                    );
                    return SubOutcome {
                        response: no_context_response(sub, started.elapsed().as_millis() as u64),
                        candidates: Vec::new(),
                        notices,
                    };
                }
            },
            Ok(candidates) => {
                let pre = self.scorer.retrieval_confidence(&candidates);
                if pre < self.cfg.confidence.threshold {
                    match self.web_fallback(&sub.text).await {
                        Some(web_candidates) => {
                            notices.push(format!(
                                "Answered \"{}\" from web search because the document index had \
                                 no confident match.",
                                sub.text
                            ));
                            (web_candidates, true)
                        }
                        None => (candidates, false),
                    }
                } else {
                    (candidates, false)
                }
            }
            Err(err) => {
                if !matches!(err, RetrievalError::Unavailable { .. }) {
                    log::warn!("Retrieval failed for sub-request {}: {err}", sub.id);
                }
                match self.web_fallback(&sub.text).await {
                    Some(web_candidates) => {
                        notices.push(format!(
                            "Answered \"{}\" from web search because document retrieval was \
                             unavailable.",
                            sub.text
                        ));
                        (web_candidates, true)
                    }
                    None => {
                        notices.push(
                            "No supporting context could be found for part of this question."
                                .to_string(),
                        );
                        return SubOutcome {
                            response: no_context_response(sub, started.elapsed().as_millis() as u64),
                            candidates: Vec::new(),
                            notices,
                        };
                    }
                }
            }
        };

        let turns = self
            .memory
            .select_context(
                session_id,
                &sub.text,
                self.cfg.memory.strategy,
                self.cfg.memory.context_token_budget,
            )
            .await;
        let prompt = build_prompt(
            &turns,
            &candidates,
            &sub.text,
            self.cfg.memory.context_token_budget,
        );
        let params = GenerationParams {
            model: hints.model.clone(),
            temperature: hints.temperature,
            max_tokens: None,
        };
        let per_call = Duration::from_millis(self.cfg.timeouts.per_call_ms);

        let generated = if hints.use_consensus {
            self.run_consensus(sub, &candidates, &prompt, &params, per_call).await
        } else {
            dispatch(
                &self.registry,
                self.backend.as_ref(),
                sub.tier,
                &prompt,
                &params,
                per_call,
            )
            .await
            .map(|generation| (generation, None))
        };

        let response = match generated {
            Ok((generation, consensus_consistency)) => {
                let mut report = self.scorer.score(sub, &candidates, &generation.text);
                if let Some(consistency) = consensus_consistency {
                    report = recompose(
                        &self.cfg.confidence,
                        report.semantic,
                        report.content_quality,
                        consistency,
                        report.complexity_adjustment,
                    );
                }
                SubResponse {
                    request_id: sub.id.clone(),
                    text: generation.text,
                    instance_id: Some(generation.instance_id),
                    sources: cite(&candidates),
                    confidence: report,
                    latency_ms: started.elapsed().as_millis() as u64,
                    via_web_fallback: via_web,
                }
            }
            Err(err) => {
                log::warn!("Generation failed for sub-request {}: {err}", sub.id);
                notices.push(format!(
                    "Part of this question could not be answered: no backend was available \
                     for \"{}\".",
                    sub.text
                ));
                SubResponse {
                    request_id: sub.id.clone(),
                    text: String::new(),
                    instance_id: None,
                    sources: Vec::new(),
                    confidence: ConfidenceReport::zero(),
                    latency_ms: started.elapsed().as_millis() as u64,
                    via_web_fallback: via_web,
                }
            }
        };

        SubOutcome {
            response,
            candidates,
            notices,
        }
    }

    /// Fan one sub-request across distinct instances and combine the
    /// responses. Fewer than `min_responses` successes falls back to
    /// single-response mode; that recovery is logged, never surfaced.
    async fn run_consensus(
        &self,
        sub: &SubRequest,
        candidates: &[RetrievalCandidate],
        prompt: &str,
        params: &GenerationParams,
        per_call: Duration,
    ) -> desk_backends::Result<(Generation, Option<f32>)> {
        let consensus = &self.cfg.consensus;
        let mut chosen = Vec::new();
        let mut exclude: Vec<String> = Vec::new();
        for _ in 0..consensus.models.max(1) {
            let exclude_refs: Vec<&str> = exclude.iter().map(String::as_str).collect();
            match self.registry.select_excluding(sub.tier, &exclude_refs) {
                Ok(instance) => {
                    exclude.push(instance.id().to_string());
                    chosen.push(instance);
                }
                Err(_) => break,
            }
        }
        if chosen.is_empty() {
            return Err(BackendError::NoHealthyBackend);
        }

        let mut join_set = JoinSet::new();
        for instance in chosen {
            let registry = Arc::clone(&self.registry);
            let backend = Arc::clone(&self.backend);
            let prompt = prompt.to_string();
            let params = params.clone();
            join_set.spawn(async move {
                generate_on(&registry, backend.as_ref(), &instance, &prompt, &params, per_call).await
            });
        }

        let mut successes: Vec<Generation> = Vec::new();
        let mut last_error: Option<BackendError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(generation)) => successes.push(generation),
                Ok(Err(err)) => last_error = Some(err),
                Err(err) => log::warn!("Consensus task failed: {err}"),
            }
        }

        if successes.len() < consensus.min_responses.max(1) {
            log::info!(
                "Consensus insufficient ({} of {} responses); falling back to single-response mode",
                successes.len(),
                consensus.models
            );
            return successes
                .into_iter()
                .next()
                .map(|generation| (generation, None))
                .ok_or(last_error.unwrap_or(BackendError::NoHealthyBackend));
        }

        let scored: Vec<(String, f32)> = successes
            .iter()
            .map(|generation| {
                let report = self.scorer.score(sub, candidates, &generation.text);
                (generation.text.clone(), report.composite)
            })
            .collect();

        let representative = match consensus.strategy {
            ConsensusStrategy::WeightedVote => weighted_vote(&scored, consensus.similarity_threshold),
            ConsensusStrategy::HighestConfidence => highest_confidence(&scored),
            ConsensusStrategy::SimilarityCluster => {
                cluster_representative(&scored, consensus.similarity_threshold)
            }
        }
        .unwrap_or(0);

        let clusters = similarity_clusters(&scored, consensus.similarity_threshold);
        let largest = clusters.iter().map(Vec::len).max().unwrap_or(1);
        let consistency = largest as f32 / scored.len().max(1) as f32;

        Ok((successes.swap_remove(representative), Some(consistency)))
    }

    async fn run_synthesis(
        &self,
        query: &Query,
        sub_responses: &[SubResponse],
        all_candidates: &[RetrievalCandidate],
        trace: &mut ReasoningTrace,
        notices: &mut Vec<String>,
    ) -> Option<String> {
        let themes = cluster_themes(all_candidates, &self.cfg.reasoning);
        let contradictions: Vec<(usize, usize)> = themes
            .iter()
            .flat_map(|theme| detect_contradictions(all_candidates, theme, &self.cfg.reasoning))
            .collect();
        if !contradictions.is_empty() {
            log::info!(
                "Detected {} contradicting source pair(s) across {} theme(s)",
                contradictions.len(),
                themes.len()
            );
        }

        let best_draft = sub_responses
            .iter()
            .map(|r| r.confidence.composite)
            .fold(0.0f32, f32::max);
        trace.record(ReasoningState::Synthesizing, best_draft);

        let prompt = build_synthesis_prompt(
            &query.text,
            sub_responses,
            all_candidates,
            &themes,
            &contradictions,
        );
        let params = GenerationParams {
            model: query.hints.model.clone(),
            temperature: query.hints.temperature,
            max_tokens: None,
        };
        match dispatch(
            &self.registry,
            self.backend.as_ref(),
            ModelTier::Deep,
            &prompt,
            &params,
            Duration::from_millis(self.cfg.timeouts.per_call_ms),
        )
        .await
        {
            Ok(generation) => Some(generation.text),
            Err(err) => {
                log::warn!("Synthesis pass failed, concatenating sub-answers: {err}");
                notices.push(
                    "The combined summary could not be generated; the partial answers are \
                     shown individually."
                        .to_string(),
                );
                None
            }
        }
    }

    async fn web_fallback(&self, query_text: &str) -> Option<Vec<RetrievalCandidate>> {
        if !self.cfg.web_fallback_enabled {
            return None;
        }
        let web = self.web.as_ref()?;
        match web.search(query_text).await {
            Ok(hits) if !hits.is_empty() => Some(candidates_from_web(hits)),
            Ok(_) => None,
            Err(err) => {
                log::warn!("Web fallback failed: {err}");
                None
            }
        }
    }

    async fn remember(&self, query: &Query, qtype: QuestionType, answer: &FinalAnswer) {
        let now_ms = crate::cache::unix_ms_now();
        self.memory
            .append_turn(ConversationTurn {
                session_id: query.session_id.clone(),
                role: Role::User,
                content: query.text.clone(),
                reasoning: qtype,
                timestamp_ms: now_ms,
            })
            .await;
        if !answer.text.trim().is_empty() {
            self.memory
                .append_turn(ConversationTurn {
                    session_id: query.session_id.clone(),
                    role: Role::Assistant,
                    content: answer.text.clone(),
                    reasoning: qtype,
                    timestamp_ms: now_ms,
                })
                .await;
        }
    }
}

/// Synthesis applies to complex queries and synthesis-type questions.
fn wants_synthesis(class: ComplexityClass, qtype: QuestionType) -> bool {
    match qtype {
        QuestionType::Synthesis => true,
        QuestionType::Simple
        | QuestionType::Analytical
        | QuestionType::Comparative
        | QuestionType::Factual
        | QuestionType::Creative
        | QuestionType::ChainOfThought => class == ComplexityClass::Complex,
    }
}

fn cite(candidates: &[RetrievalCandidate]) -> Vec<Citation> {
    candidates
        .iter()
        .map(|candidate| Citation {
            chunk_id: candidate.chunk_id.clone(),
            doc_id: candidate.doc_id.clone(),
            snippet: candidate.text.chars().take(CITATION_SNIPPET_CHARS).collect(),
        })
        .collect()
}

fn no_context_response(sub: &SubRequest, latency_ms: u64) -> SubResponse {
    SubResponse {
        request_id: sub.id.clone(),
        text: "I could not find supporting context to answer this.".to_string(),
        instance_id: None,
        sources: Vec::new(),
        confidence: ConfidenceReport::zero(),
        latency_ms,
        via_web_fallback: false,
    }
}

async fn emit_answer(tx: &mpsc::Sender<AnswerEvent>, answer: &FinalAnswer) {
    for notice in &answer.notices {
        if tx
            .send(AnswerEvent::Notice {
                message: notice.clone(),
            })
            .await
            .is_err()
        {
            return;
        }
    }
    if tx
        .send(AnswerEvent::Citations {
            citations: answer.citations.clone(),
        })
        .await
        .is_err()
    {
        return;
    }
    if tx
        .send(AnswerEvent::Confidence {
            report: answer.confidence,
        })
        .await
        .is_err()
    {
        return;
    }
    for token in answer.text.split_inclusive(' ') {
        if tx
            .send(AnswerEvent::Token {
                text: token.to_string(),
            })
            .await
            .is_err()
        {
            return;
        }
    }
    let _ = tx
        .send(AnswerEvent::Done {
            answer: answer.clone(),
        })
        .await;
}
