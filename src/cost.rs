use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded extraction event
#[derive(Debug, Clone)]
pub struct ExtractionRecord {
    pub extractor_type: String,
    pub cost: f64,
    pub memories_extracted: usize,
    pub messages_processed: usize,
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
struct AgentSpend {
    month: String,
    total_cost: f64,
    extractions: u64,
    memories_extracted: u64,
}

/// Per-agent monthly budget accounting. One mutex over the whole map makes
/// check/track linearisable per agent id; a burst of concurrent discoveries
/// may read a momentarily stale total, but no call double-charges.
#[derive(Default)]
pub struct CostTracker {
    agents: Mutex<HashMap<String, AgentSpend>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn month_key() -> String {
        Utc::now().format("%Y-%m").to_string()
    }

    /// TRUE iff spend-to-date for the current month is below the budget.
    /// `None` disables the check.
    pub fn check_budget(&self, agent_id: &str, monthly_budget: Option<f64>) -> bool {
        let Some(budget) = monthly_budget else {
            return true;
        };
        if budget.is_infinite() {
            return true;
        }
        let month = Self::month_key();
        let mut agents = self.agents.lock().unwrap();
        let spend = agents.entry(agent_id.to_string()).or_default();
        if spend.month != month {
            // New month: counters reset lazily on first touch.
            *spend = AgentSpend {
                month,
                ..AgentSpend::default()
            };
        }
        spend.total_cost < budget
    }

    pub fn track_extraction(&self, agent_id: &str, record: &ExtractionRecord) {
        let month = Self::month_key();
        let mut agents = self.agents.lock().unwrap();
        let spend = agents.entry(agent_id.to_string()).or_default();
        if spend.month != month {
            *spend = AgentSpend {
                month,
                ..AgentSpend::default()
            };
        }
        spend.total_cost += record.cost;
        spend.extractions += 1;
        spend.memories_extracted += record.memories_extracted as u64;
    }

    /// Spend-to-date for the current month.
    pub fn month_spend(&self, agent_id: &str) -> f64 {
        let month = Self::month_key();
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .filter(|s| s.month == month)
            .map(|s| s.total_cost)
            .unwrap_or(0.0)
    }

    /// Number of tracked extractions this month.
    pub fn extraction_count(&self, agent_id: &str) -> u64 {
        let month = Self::month_key();
        self.agents
            .lock()
            .unwrap()
            .get(agent_id)
            .filter(|s| s.month == month)
            .map(|s| s.extractions)
            .unwrap_or(0)
    }
}
