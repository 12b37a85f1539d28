// =============================================================================
// Decision log — auditable record of every entry/exit decision
// =============================================================================
//
// Every tick-loop candidate flows through the risk gate, the regime filter,
// the alignment/intensity signal gates, and the sizing pipeline. This struct
// captures which layer allowed or blocked the decision so the dashboard and
// post-hoc review can reconstruct why a code did or didn't trade that tick.
// =============================================================================

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub id: String,
    pub code: String,
    pub side: String,
    pub risk_verdict: String,
    pub regime_verdict: String,
    pub signal_verdict: String,
    pub sizing_verdict: String,
    pub final_decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_fraction: Option<f64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DecisionRecord {
    pub fn allow(code: impl Into<String>, side: impl Into<String>, position_fraction: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            side: side.into(),
            risk_verdict: "PASS".to_string(),
            regime_verdict: "PASS".to_string(),
            signal_verdict: "PASS".to_string(),
            sizing_verdict: "PASS".to_string(),
            final_decision: "ALLOW".to_string(),
            skip_reason: None,
            position_fraction: Some(position_fraction),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn skip(code: impl Into<String>, side: impl Into<String>, layer: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut record = Self {
            id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            side: side.into(),
            risk_verdict: "PASS".to_string(),
            regime_verdict: "PASS".to_string(),
            signal_verdict: "PASS".to_string(),
            sizing_verdict: "PASS".to_string(),
            final_decision: "SKIP".to_string(),
            skip_reason: Some(reason.clone()),
            position_fraction: None,
            created_at: chrono::Utc::now(),
        };
        match layer {
            "risk" => record.risk_verdict = format!("FAIL: {reason}"),
            "regime" => record.regime_verdict = format!("FAIL: {reason}"),
            "signal" => record.signal_verdict = format!("FAIL: {reason}"),
            "sizing" => record.sizing_verdict = format!("FAIL: {reason}"),
            _ => {}
        }
        record
    }
}
