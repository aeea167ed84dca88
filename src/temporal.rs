use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::{CostControlSettings, LlmEnhancementSettings};
use crate::cost::CostTracker;
use crate::llm::{parse_validated, ChatMessage, StructuredLlm};
use crate::Memory;

/// Minimum sample size before any pattern is reported.
const MIN_MEMORIES: usize = 5;
/// Sample size before the LLM pass is even considered.
const LLM_MIN_MEMORIES: usize = 20;
const BURST_WINDOW_MS: i64 = 30 * 60 * 1000;
const BURST_MIN_SIZE: usize = 5;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    Hourly,
    Weekly,
    Burst,
}

#[derive(Debug, Clone)]
pub struct TemporalPattern {
    pub pattern_type: PatternType,
    pub description: String,
    pub confidence: f32,
    /// Memory count behind the pattern.
    pub frequency: u32,
    /// Hour-of-day or day-of-week index, for periodic patterns.
    pub peak: Option<u32>,
    /// Ids covered by a burst.
    pub memory_ids: Vec<String>,
    pub llm_generated: bool,
}

#[derive(Debug, Clone)]
pub struct ActivityCluster {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub memory_ids: Vec<String>,
    pub intensity: f32,
    pub topics: Vec<String>,
}

#[derive(Deserialize)]
struct LlmPatternList {
    patterns: Vec<LlmPattern>,
}

#[derive(Deserialize)]
struct LlmPattern {
    pattern_type: PatternType,
    description: String,
    confidence: f32,
    frequency: u32,
}

/// Statistical pattern mining over memory timestamps, with an optional
/// budget-gated LLM pass for larger samples.
pub struct TemporalAnalyzer {
    llm: Option<Arc<dyn StructuredLlm>>,
    cost: Arc<CostTracker>,
    cost_control: CostControlSettings,
    llm_settings: LlmEnhancementSettings,
}

impl TemporalAnalyzer {
    pub fn new(
        llm: Option<Arc<dyn StructuredLlm>>,
        cost: Arc<CostTracker>,
        cost_control: CostControlSettings,
        llm_settings: LlmEnhancementSettings,
    ) -> Self {
        Self {
            llm,
            cost,
            cost_control,
            llm_settings,
        }
    }

    /// Mine hourly, weekly and burst patterns from the given memories,
    /// optionally restricted to a window. Fewer than five memories yield
    /// nothing.
    pub async fn analyze_patterns(
        &self,
        agent_id: &str,
        memories: &[Memory],
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Vec<TemporalPattern> {
        let scoped: Vec<&Memory> = memories
            .iter()
            .filter(|m| {
                window.map_or(true, |(start, end)| {
                    m.created_at >= start && m.created_at <= end
                })
            })
            .collect();
        if scoped.len() < MIN_MEMORIES {
            return Vec::new();
        }

        let mut patterns = Vec::new();
        patterns.extend(hourly_patterns(&scoped));
        patterns.extend(weekly_patterns(&scoped));
        patterns.extend(burst_patterns(&scoped));

        if scoped.len() >= LLM_MIN_MEMORIES
            && self.cost_control.prefer_embedding_when_similar
            && self
                .cost
                .check_budget(agent_id, self.cost_control.monthly_budget)
        {
            if let Some(llm) = self.llm.clone() {
                patterns.extend(self.llm_patterns(llm.as_ref(), &scoped).await);
            }
        }

        dedupe_patterns(patterns)
    }

    /// Group memories into 1-hour activity windows; clusters of three or
    /// more are reported, most intense first.
    pub fn detect_activity_clusters(&self, memories: &[Memory]) -> Vec<ActivityCluster> {
        let mut ordered: Vec<&Memory> = memories.iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut clusters = Vec::new();
        let mut current: Vec<&Memory> = Vec::new();
        for memory in ordered {
            let belongs = current.first().map_or(true, |first| {
                (memory.created_at - first.created_at).num_milliseconds() <= 3_600_000
            });
            if belongs {
                current.push(memory);
            } else {
                if current.len() >= 3 {
                    clusters.push(build_cluster(&current));
                }
                current = vec![memory];
            }
        }
        if current.len() >= 3 {
            clusters.push(build_cluster(&current));
        }

        clusters.sort_by(|a, b| {
            b.intensity
                .partial_cmp(&a.intensity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        clusters
    }

    async fn llm_patterns(
        &self,
        llm: &dyn StructuredLlm,
        memories: &[&Memory],
    ) -> Vec<TemporalPattern> {
        let timestamps: Vec<String> = memories
            .iter()
            .map(|m| m.created_at.to_rfc3339())
            .collect();
        let schema = json!({
            "type": "object",
            "properties": {
                "patterns": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "pattern_type": { "type": "string", "enum": ["hourly", "weekly", "burst"] },
                            "description": { "type": "string" },
                            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
                            "frequency": { "type": "integer", "minimum": 0 }
                        },
                        "required": ["pattern_type", "description", "confidence", "frequency"]
                    }
                }
            },
            "required": ["patterns"]
        });
        let messages = [ChatMessage::user(format!(
            "These are timestamps of an agent's memories:\n{}\n\n\
             Identify recurring temporal patterns worth reporting.",
            timestamps.join("\n")
        ))];

        let output = match llm
            .generate_object(&schema, &messages, self.llm_settings.temperature)
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "temporal llm pass failed, statistical patterns only");
                return Vec::new();
            }
        };
        let parsed: LlmPatternList = match parse_validated(&output) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(error = %err, "temporal llm response failed validation");
                return Vec::new();
            }
        };

        parsed
            .patterns
            .into_iter()
            .filter(|p| (0.0..=1.0).contains(&p.confidence))
            .map(|p| TemporalPattern {
                pattern_type: p.pattern_type,
                description: p.description,
                confidence: p.confidence,
                frequency: p.frequency,
                peak: None,
                memory_ids: Vec::new(),
                llm_generated: true,
            })
            .collect()
    }
}

fn hourly_patterns(memories: &[&Memory]) -> Vec<TemporalPattern> {
    let mut counts = [0u32; 24];
    for memory in memories {
        counts[memory.created_at.hour() as usize] += 1;
    }
    let mean = memories.len() as f32 / 24.0;
    counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count as f32 > 1.5 * mean)
        .map(|(hour, &count)| TemporalPattern {
            pattern_type: PatternType::Hourly,
            description: format!("Activity peaks around {:02}:00 UTC", hour),
            confidence: (count as f32 / mean / 3.0).min(0.9),
            frequency: count,
            peak: Some(hour as u32),
            memory_ids: Vec::new(),
            llm_generated: false,
        })
        .collect()
}

fn weekly_patterns(memories: &[&Memory]) -> Vec<TemporalPattern> {
    const DAYS: [&str; 7] = [
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
        "Sunday",
    ];
    let mut counts = [0u32; 7];
    for memory in memories {
        counts[memory.created_at.weekday().num_days_from_monday() as usize] += 1;
    }
    let mean = memories.len() as f32 / 7.0;
    counts
        .iter()
        .enumerate()
        .filter(|(_, &count)| count as f32 > 1.3 * mean)
        .map(|(day, &count)| TemporalPattern {
            pattern_type: PatternType::Weekly,
            description: format!("Activity peaks on {}s", DAYS[day]),
            confidence: (count as f32 / mean / 2.5).min(0.85),
            frequency: count,
            peak: Some(day as u32),
            memory_ids: Vec::new(),
            llm_generated: false,
        })
        .collect()
}

/// Sliding 30-minute window; after a burst is emitted the scan skips half a
/// window to avoid reporting overlapping bursts.
fn burst_patterns(memories: &[&Memory]) -> Vec<TemporalPattern> {
    let mut ordered: Vec<&Memory> = memories.to_vec();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

    let mut patterns = Vec::new();
    let mut i = 0;
    while i < ordered.len() {
        let window_start = ordered[i].created_at_ms();
        let window: Vec<&&Memory> = ordered[i..]
            .iter()
            .take_while(|m| m.created_at_ms() - window_start <= BURST_WINDOW_MS)
            .collect();
        if window.len() >= BURST_MIN_SIZE {
            patterns.push(TemporalPattern {
                pattern_type: PatternType::Burst,
                description: format!("Burst of {} memories within 30 minutes", window.len()),
                confidence: (window.len() as f32 / 10.0).min(0.8),
                frequency: window.len() as u32,
                peak: None,
                memory_ids: window.iter().map(|m| m.id.clone()).collect(),
                llm_generated: false,
            });
            i += (window.len() / 2).max(1);
        } else {
            i += 1;
        }
    }
    patterns
}

/// Keep the highest-confidence entry per (type, frequency); order by
/// confidence descending.
fn dedupe_patterns(patterns: Vec<TemporalPattern>) -> Vec<TemporalPattern> {
    let mut best: HashMap<(PatternType, u32), TemporalPattern> = HashMap::new();
    for pattern in patterns {
        let key = (pattern.pattern_type, pattern.frequency);
        match best.get(&key) {
            Some(existing) if existing.confidence >= pattern.confidence => {}
            _ => {
                best.insert(key, pattern);
            }
        }
    }
    let mut deduped: Vec<TemporalPattern> = best.into_values().collect();
    deduped.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.description.cmp(&b.description))
    });
    deduped
}

fn build_cluster(members: &[&Memory]) -> ActivityCluster {
    let start = members.first().expect("non-empty cluster").created_at;
    let end = members.last().expect("non-empty cluster").created_at;
    let duration_hours = ((end - start).num_minutes() as f32 / 60.0).max(0.5);
    let intensity = (members.len() as f32 / duration_hours / 10.0).min(1.0);

    let mut topics: Vec<String> = Vec::new();
    'outer: for memory in members {
        for keyword in &memory.keywords {
            if !topics.contains(keyword) {
                topics.push(keyword.clone());
                if topics.len() >= 5 {
                    break 'outer;
                }
            }
        }
    }

    ActivityCluster {
        start,
        end,
        memory_ids: members.iter().map(|m| m.id.clone()).collect(),
        intensity,
        topics,
    }
}
