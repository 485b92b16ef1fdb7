use std::collections::BTreeMap;

use crate::error::{PollError, PollResult};
use crate::models::{Nominations, Rankings, ResultEntry, Results};

/// Points a nomination earns at `position` (0 = most preferred) of one ballot.
///
/// `((v - n/2) / v) ^ (n + 1)`: the top choice is always worth exactly 1 and each
/// later slot is worth strictly less.
pub fn weight(position: usize, votes_per_voter: u32) -> f64 {
    let v = f64::from(votes_per_voter);
    let n = position as f64;
    ((v - 0.5 * n) / v).powi(position as i32 + 1)
}

/// Sums positional weights over every ballot and orders nominations by score.
///
/// Nominations nobody ranked are left out. Equal scores keep nomination id order.
pub fn score(rankings: &Rankings, nominations: &Nominations, votes_per_voter: u32) -> PollResult<Results> {
    let mut scores: BTreeMap<&str, f64> = BTreeMap::new();

    for ballot in rankings.values() {
        for (position, nomination_id) in ballot.iter().enumerate() {
            *scores.entry(nomination_id.as_str()).or_insert(0.0) += weight(position, votes_per_voter);
        }
    }

    let mut results = scores
        .into_iter()
        .map(|(nomination_id, score)| {
            let nomination = nominations.get(nomination_id).ok_or_else(|| {
                PollError::InvalidReference(format!("Ranking references unknown nomination {}", nomination_id))
            })?;
            Ok(ResultEntry {
                nomination_id: nomination_id.to_string(),
                nomination_text: nomination.text.clone(),
                score,
            })
        })
        .collect::<PollResult<Results>>()?;

    // Highest score first
    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    Ok(results)
}
