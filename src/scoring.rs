//! Lead temperature scoring
//!
//! A pure heuristic over the shape of a stalled conversation. Scores run
//! 1 to 10 and feed the estimated recovery value.

use crate::db::Direction;

/// High-intent words in the last message push the score up
const INTENT_KEYWORDS: [&str; 7] = [
    "quanto", "preço", "valor", "agendar", "quero", "preciso", "gostaria",
];

/// Closing words suggest the conversation already ended
const CLOSING_KEYWORDS: [&str; 5] = ["obrigado", "tchau", "ok", "valeu", "flw"];

/// Inputs to the scorer, extracted from a stalled conversation
#[derive(Debug, Clone)]
pub struct ScoreInput<'a> {
    /// Text of the last message in the thread
    pub last_message: &'a str,
    /// Who spoke last; an outbound-last thread means the customer went
    /// silent, an inbound-last thread means the business did
    pub last_direction: Direction,
    pub hours_of_silence: i64,
    /// The contact converted in some earlier recovery
    pub prior_purchase: bool,
    /// The thread's estimate sits above the tenant's average ticket
    pub above_average_value: bool,
}

/// Scored temperature with a human-readable explanation
#[derive(Debug, Clone)]
pub struct TemperatureResult {
    pub score: u8,
    pub label: String,
    pub emoji: String,
    pub explanation: String,
    /// Human-readable scoring signals; never empty
    pub reasons: Vec<String>,
}

impl TemperatureResult {
    #[must_use]
    pub const fn is_hot(&self) -> bool {
        self.score >= 8
    }
}

/// Score a stalled conversation
#[must_use]
pub fn score_conversation(input: &ScoreInput<'_>) -> TemperatureResult {
    let mut temp: i32 = 5;
    let mut reasons: Vec<&str> = Vec::new();

    if input.hours_of_silence <= 24 {
        temp += 3;
        reasons.push("recent message, under a day old");
    } else if input.hours_of_silence <= 72 {
        temp += 1;
        reasons.push("still fresh, under three days");
    } else if input.hours_of_silence > 168 {
        temp -= 2;
        reasons.push("silent for over a week");
    }

    let msg = input.last_message.to_lowercase();
    if INTENT_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        temp += 2;
        reasons.push("asked about price or scheduling");
    }
    if CLOSING_KEYWORDS.iter().any(|kw| msg.contains(kw)) {
        temp -= 3;
        reasons.push("sounds like the conversation already closed");
    }

    // The business dropping the ball is the easier recovery
    if input.last_direction == Direction::Inbound {
        temp += 1;
        reasons.push("the business left them hanging");
    }

    if input.prior_purchase {
        temp += 1;
        reasons.push("bought before");
    }
    if input.above_average_value {
        temp += 1;
        reasons.push("worth more than the average ticket");
    }

    if reasons.is_empty() {
        reasons.push("no strong signals either way");
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let score = temp.clamp(1, 10) as u8;

    let (label, emoji) = if score >= 8 {
        ("Hot", "🔥")
    } else if score >= 5 {
        ("Warm", "🌡️")
    } else {
        ("Cold", "❄️")
    };

    TemperatureResult {
        score,
        label: label.to_owned(),
        emoji: emoji.to_owned(),
        explanation: format!("{emoji} {label} because {}", reasons.join(", ")),
        reasons: reasons.into_iter().map(str::to_owned).collect(),
    }
}

/// Estimated recovery value: the tenant's average ticket weighted by the
/// temperature score
#[must_use]
pub const fn estimate_value_cents(avg_ticket_cents: i64, score: u8) -> i64 {
    avg_ticket_cents * score as i64 / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(last_message: &str, last_direction: Direction, hours: i64) -> ScoreInput<'_> {
        ScoreInput {
            last_message,
            last_direction,
            hours_of_silence: hours,
            prior_purchase: false,
            above_average_value: false,
        }
    }

    #[test]
    fn recent_intent_and_business_silence_is_hot() {
        // 5 base + 3 recent + 2 intent + 1 business silent = 11, clamped to 10
        let result = score_conversation(&input("quanto custa o corte?", Direction::Inbound, 12));
        assert_eq!(result.score, 10);
        assert_eq!(result.label, "Hot");
        assert!(result.is_hot());
        assert!(result.explanation.contains("price or scheduling"));
    }

    #[test]
    fn old_closed_conversation_is_cold() {
        // 5 base - 2 old - 3 closing = 0, clamped to 1
        let result = score_conversation(&input("ok obrigado, tchau", Direction::Outbound, 200));
        assert_eq!(result.score, 1);
        assert_eq!(result.label, "Cold");
    }

    #[test]
    fn neutral_conversation_is_warm_with_explanation() {
        let result = score_conversation(&input("me avisa qualquer coisa", Direction::Outbound, 100));
        assert_eq!(result.score, 5);
        assert_eq!(result.label, "Warm");
        assert!(!result.explanation.is_empty());
        // a signal-free conversation still gets a reason
        assert_eq!(result.reasons, vec!["no strong signals either way"]);
    }

    #[test]
    fn history_signals_raise_the_score() {
        let mut base = input("me avisa", Direction::Outbound, 100);
        base.prior_purchase = true;
        base.above_average_value = true;
        assert_eq!(score_conversation(&base).score, 7);
    }

    #[test]
    fn score_is_always_clamped() {
        for hours in [1, 50, 100, 500] {
            for msg in ["quanto?", "tchau", "oi"] {
                let score = score_conversation(&input(msg, Direction::Inbound, hours)).score;
                assert!((1..=10).contains(&score));
            }
        }
    }

    #[test]
    fn value_scales_with_temperature() {
        assert_eq!(estimate_value_cents(10_000, 10), 10_000);
        assert_eq!(estimate_value_cents(10_000, 5), 5_000);
        assert_eq!(estimate_value_cents(10_000, 1), 1_000);
    }
}
