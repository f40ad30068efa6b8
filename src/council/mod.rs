//! Dual-agent generator/auditor coordination and council synthesis.
//!
//! A generator voice drafts on the speed or balanced tier; an auditor on
//! the quality tier scores the draft (0-100), lists issues, and proposes
//! refinements. Low scores with concrete refinements trigger one refine
//! pass. Every phase lands in an ordered audit trail. If the auditor is
//! unavailable the draft ships as-is with reduced confidence and a
//! warning in the trail.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BackendAdapter, ChatMessage, GenerateOptions};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::events::{AuditPhase, AuditStep, AuditTrail};
use crate::voice::VoiceId;

/// Audit score below which a refine pass runs (when refinements exist).
pub const DEFAULT_AUDIT_THRESHOLD: u8 = 80;
/// Confidence assigned when the auditor is unavailable.
const UNAUDITED_CONFIDENCE: f64 = 0.6;

/// Severity of an audit issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Info,
    Warning,
    Critical,
}

/// One issue raised by the auditor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditIssue {
    pub severity: IssueSeverity,
    pub description: String,
    /// Security-flavored issues surface as warnings even when not critical
    pub security: bool,
}

/// Parsed auditor verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    /// Quality score 0-100
    pub score: u8,
    pub issues: Vec<AuditIssue>,
    /// Concrete refinement instructions
    pub refinements: Vec<String>,
}

impl AuditReport {
    /// Security warnings, which count even when non-critical.
    pub fn security_warnings(&self) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.security)
            .map(|i| format!("security: {}", i.description))
            .collect()
    }
}

/// The coordinated reply handed back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatedResponse {
    pub content: String,
    pub audit_trail: AuditTrail,
    /// Confidence in the reply [0,1]
    pub confidence: f64,
    pub model_used: String,
    pub response_time_ms: u64,
    pub warnings: Vec<String>,
    /// Set when cancellation interrupted the loop; partial trail retained
    pub cancelled: bool,
}

/// A chunk of the streaming coordination variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilChunk {
    /// Generator text delta
    Chunk { content: String },
    /// Audit verdict, emitted once between generation and completion
    Audit { score: u8, issues: usize },
    /// Terminal chunk carrying the full response
    Complete { response: CoordinatedResponse },
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Score threshold under which a refine pass runs
    pub audit_threshold: u8,
    /// Options for generator calls
    pub generator_options: GenerateOptions,
    /// Options for auditor calls
    pub auditor_options: GenerateOptions,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            audit_threshold: DEFAULT_AUDIT_THRESHOLD,
            generator_options: GenerateOptions::new(),
            auditor_options: GenerateOptions::new().with_temperature(0.2),
        }
    }
}

/// Build the auditor prompt for a draft.
fn audit_prompt(request: &str, draft: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are a strict auditor. Review the draft answer below against the \
         original request.\n\n",
    );
    prompt.push_str("## Request\n");
    prompt.push_str(request);
    prompt.push_str("\n\n## Draft\n");
    prompt.push_str(draft);
    prompt.push_str("\n\n## Output format\n");
    prompt.push_str("SCORE: <0-100>\n");
    prompt.push_str("ISSUE: [info|warning|critical] <description>\n");
    prompt.push_str("REFINE: <concrete instruction> (one line per refinement)\n");
    prompt.push_str("Prefix security-relevant issues with SECURITY.\n");
    prompt
}

/// Parse the auditor's reply into a report.
///
/// Unparseable replies degrade to a passing score with zero issues; the
/// caller records a warning for that case.
fn parse_audit(content: &str) -> Option<AuditReport> {
    let mut score = None;
    let mut issues = Vec::new();
    let mut refinements = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("SCORE:") {
            score = rest.trim().parse::<u8>().ok().map(|s| s.min(100));
        } else if let Some(rest) = line.strip_prefix("ISSUE:") {
            let rest = rest.trim();
            let (severity, description) = if let Some(d) = rest.strip_prefix("[critical]") {
                (IssueSeverity::Critical, d)
            } else if let Some(d) = rest.strip_prefix("[warning]") {
                (IssueSeverity::Warning, d)
            } else if let Some(d) = rest.strip_prefix("[info]") {
                (IssueSeverity::Info, d)
            } else {
                (IssueSeverity::Info, rest)
            };
            let description = description.trim();
            issues.push(AuditIssue {
                severity,
                description: description.to_string(),
                security: description.to_uppercase().starts_with("SECURITY"),
            });
        } else if let Some(rest) = line.strip_prefix("REFINE:") {
            let rest = rest.trim();
            if !rest.is_empty() {
                refinements.push(rest.to_string());
            }
        }
    }

    score.map(|score| AuditReport {
        score,
        issues,
        refinements,
    })
}

/// Dual-agent generator/auditor coordinator.
pub struct DualAgentCoordinator {
    generator: Arc<dyn BackendAdapter>,
    auditor: Option<Arc<dyn BackendAdapter>>,
    config: CouncilConfig,
}

impl DualAgentCoordinator {
    pub fn new(
        generator: Arc<dyn BackendAdapter>,
        auditor: Option<Arc<dyn BackendAdapter>>,
    ) -> Self {
        Self {
            generator,
            auditor,
            config: CouncilConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CouncilConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the generate → audit → refine → approve loop.
    ///
    /// Cancellation at any await point cancels the in-flight adapter call
    /// and returns a partial response with the finalized steps retained.
    pub async fn coordinate(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<CoordinatedResponse> {
        let started = Instant::now();
        let mut trail = AuditTrail::new();
        let mut warnings = Vec::new();

        trail.push(AuditStep::start(
            AuditPhase::Generate,
            format!("generator {}", self.generator.id()),
        ));

        let draft = match self.generate(system_prompt, prompt, cancel).await {
            Ok(draft) => draft,
            Err(Error::Cancelled) => {
                return Ok(Self::cancelled_response(trail, warnings, started));
            }
            Err(err) => return Err(err),
        };
        let model_used = draft.model.clone();

        let Some(auditor) = &self.auditor else {
            warnings.push("auditor unavailable; response is unaudited".to_string());
            trail.push(AuditStep::complete(
                AuditPhase::Approve,
                "approved without audit",
            ));
            return Ok(CoordinatedResponse {
                content: draft.content,
                audit_trail: trail,
                confidence: UNAUDITED_CONFIDENCE,
                model_used,
                response_time_ms: started.elapsed().as_millis() as u64,
                warnings,
                cancelled: false,
            });
        };

        trail.push(AuditStep::start(
            AuditPhase::Audit,
            format!("auditor {}", auditor.id()),
        ));

        let audit_outcome = cancel
            .guard(auditor.generate(&audit_prompt(prompt, &draft.content), &self.config.auditor_options))
            .await;

        let report = match audit_outcome {
            Ok(reply) => match parse_audit(&reply.content) {
                Some(report) => report,
                None => {
                    warnings.push("auditor reply was unparseable; treating as pass".to_string());
                    AuditReport {
                        score: self.config.audit_threshold,
                        issues: Vec::new(),
                        refinements: Vec::new(),
                    }
                }
            },
            Err(Error::Cancelled) => {
                return Ok(Self::cancelled_response(trail, warnings, started));
            }
            Err(err) => {
                // Auditor down: ship the draft with reduced confidence.
                warn!(error = %err, "auditor call failed; shipping unaudited draft");
                warnings.push(format!("auditor unavailable: {}", err));
                trail.push(AuditStep::complete(
                    AuditPhase::Approve,
                    "approved without audit",
                ));
                return Ok(CoordinatedResponse {
                    content: draft.content,
                    audit_trail: trail,
                    confidence: UNAUDITED_CONFIDENCE,
                    model_used,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    warnings,
                    cancelled: false,
                });
            }
        };

        warnings.extend(report.security_warnings());
        debug!(score = report.score, issues = report.issues.len(), "audit verdict");

        let mut content = draft.content;
        let mut refined = false;
        if report.score < self.config.audit_threshold && !report.refinements.is_empty() {
            let refine_prompt = format!(
                "{}\n\nYour previous draft:\n{}\n\nApply these refinements and \
                 answer again in full:\n- {}",
                prompt,
                content,
                report.refinements.join("\n- ")
            );
            match self.generate(system_prompt, &refine_prompt, cancel).await {
                Ok(better) => {
                    content = better.content;
                    refined = true;
                    trail.push(AuditStep::complete(
                        AuditPhase::Refine,
                        format!("score {} below {}", report.score, self.config.audit_threshold),
                    ));
                }
                Err(Error::Cancelled) => {
                    return Ok(Self::cancelled_response(trail, warnings, started));
                }
                Err(err) => {
                    warnings.push(format!("refinement failed, keeping draft: {}", err));
                }
            }
        }

        trail.push(AuditStep::complete(
            AuditPhase::Approve,
            format!("score {}", report.score),
        ));

        let confidence = if refined {
            ((report.score as f64 / 100.0) + 0.1).min(0.9)
        } else {
            report.score as f64 / 100.0
        };

        info!(
            model = %model_used,
            confidence,
            refined,
            "dual-agent coordination complete"
        );

        Ok(CoordinatedResponse {
            content,
            audit_trail: trail,
            confidence,
            model_used,
            response_time_ms: started.elapsed().as_millis() as u64,
            warnings,
            cancelled: false,
        })
    }

    /// Streaming variant: generator chunks are forwarded as they arrive,
    /// then an audit chunk, then the terminal complete chunk.
    pub async fn coordinate_stream(
        &self,
        system_prompt: Option<String>,
        prompt: String,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Stream<Item = Result<CouncilChunk>> + Send>> {
        let generator = self.generator.clone();
        let auditor = self.auditor.clone();
        let config = self.config.clone();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<CouncilChunk>>(32);
        tokio::spawn(async move {
            let coordinator = DualAgentCoordinator {
                generator: generator.clone(),
                auditor,
                config: config.clone(),
            };
            let started = Instant::now();
            let mut trail = AuditTrail::new();
            trail.push(AuditStep::start(
                AuditPhase::Generate,
                format!("generator {}", generator.id()),
            ));

            // Stream the draft, accumulating it for the audit pass.
            let full_prompt = match &system_prompt {
                Some(system) => format!("{}\n\n{}", system, prompt),
                None => prompt.clone(),
            };
            let stream = cancel
                .guard(generator.stream(&full_prompt, &config.generator_options))
                .await;
            let mut draft = String::new();
            match stream {
                Ok(mut chunks) => loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => None,
                        next = chunks.next() => next,
                    };
                    match next {
                        Some(Ok(chunk)) => {
                            if !chunk.content.is_empty() {
                                draft.push_str(&chunk.content);
                                if tx
                                    .send(Ok(CouncilChunk::Chunk {
                                        content: chunk.content,
                                    }))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            if chunk.done {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            let _ = tx.send(Err(err)).await;
                            return;
                        }
                        None => break,
                    }
                },
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    return;
                }
            }

            if cancel.is_cancelled() {
                let response = Self::cancelled_response(trail, Vec::new(), started);
                let _ = tx.send(Ok(CouncilChunk::Complete { response })).await;
                return;
            }

            // Audit the accumulated draft through the buffered path.
            let response = coordinator
                .audit_draft(&prompt, draft, trail, started, &cancel)
                .await;
            match response {
                Ok(response) => {
                    if !response.cancelled {
                        let _ = tx
                            .send(Ok(CouncilChunk::Audit {
                                score: (response.confidence * 100.0) as u8,
                                issues: response.warnings.len(),
                            }))
                            .await;
                    }
                    let _ = tx.send(Ok(CouncilChunk::Complete { response })).await;
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });

        Box::pin(tokio_stream_from(rx))
    }

    /// Audit (and possibly refine) an already-generated draft.
    async fn audit_draft(
        &self,
        prompt: &str,
        draft: String,
        mut trail: AuditTrail,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<CoordinatedResponse> {
        let mut warnings = Vec::new();
        let model_used = self.generator.id().to_string();

        let Some(auditor) = &self.auditor else {
            warnings.push("auditor unavailable; response is unaudited".to_string());
            trail.push(AuditStep::complete(
                AuditPhase::Approve,
                "approved without audit",
            ));
            return Ok(CoordinatedResponse {
                content: draft,
                audit_trail: trail,
                confidence: UNAUDITED_CONFIDENCE,
                model_used,
                response_time_ms: started.elapsed().as_millis() as u64,
                warnings,
                cancelled: false,
            });
        };

        trail.push(AuditStep::start(
            AuditPhase::Audit,
            format!("auditor {}", auditor.id()),
        ));

        let outcome = cancel
            .guard(auditor.generate(&audit_prompt(prompt, &draft), &self.config.auditor_options))
            .await;
        let report = match outcome {
            Ok(reply) => parse_audit(&reply.content).unwrap_or(AuditReport {
                score: self.config.audit_threshold,
                issues: Vec::new(),
                refinements: Vec::new(),
            }),
            Err(Error::Cancelled) => {
                return Ok(Self::cancelled_response(trail, warnings, started));
            }
            Err(err) => {
                warnings.push(format!("auditor unavailable: {}", err));
                trail.push(AuditStep::complete(
                    AuditPhase::Approve,
                    "approved without audit",
                ));
                return Ok(CoordinatedResponse {
                    content: draft,
                    audit_trail: trail,
                    confidence: UNAUDITED_CONFIDENCE,
                    model_used,
                    response_time_ms: started.elapsed().as_millis() as u64,
                    warnings,
                    cancelled: false,
                });
            }
        };

        warnings.extend(report.security_warnings());
        trail.push(AuditStep::complete(
            AuditPhase::Approve,
            format!("score {}", report.score),
        ));

        Ok(CoordinatedResponse {
            content: draft,
            audit_trail: trail,
            confidence: report.score as f64 / 100.0,
            model_used,
            response_time_ms: started.elapsed().as_millis() as u64,
            warnings,
            cancelled: false,
        })
    }

    async fn generate(
        &self,
        system_prompt: Option<&str>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<crate::backend::BackendResponse> {
        let messages = match system_prompt {
            Some(system) => vec![ChatMessage::system(system), ChatMessage::user(prompt)],
            None => vec![ChatMessage::user(prompt)],
        };
        cancel
            .guard(self.generator.chat(&messages, &self.config.generator_options))
            .await
    }

    fn cancelled_response(
        trail: AuditTrail,
        warnings: Vec<String>,
        started: Instant,
    ) -> CoordinatedResponse {
        CoordinatedResponse {
            content: String::new(),
            audit_trail: trail,
            confidence: 0.0,
            model_used: String::new(),
            response_time_ms: started.elapsed().as_millis() as u64,
            warnings,
            cancelled: true,
        }
    }
}

/// Build the council synthesis prompt from per-voice outputs.
pub fn council_prompt(request: &str, outputs: &[(VoiceId, String)]) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "Several specialist voices answered the same request. Merge their \
         answers into one coherent reply: keep the strongest points, resolve \
         disagreements explicitly, and drop repetition.\n\n",
    );
    prompt.push_str("## Request\n");
    prompt.push_str(request);
    prompt.push('\n');
    for (voice, output) in outputs {
        prompt.push_str(&format!("\n## {} says\n{}\n", voice, output));
    }
    prompt
}

fn tokio_stream_from<T>(
    mut rx: tokio::sync::mpsc::Receiver<T>,
) -> impl Stream<Item = T> + Send
where
    T: Send + 'static,
{
    futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
}
