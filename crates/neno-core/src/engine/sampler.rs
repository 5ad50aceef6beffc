//! Token sampling over raw logits.
//!
//! Transform order: repetition penalty, temperature, top-k, top-p,
//! multinomial draw. Temperature 0 short-circuits to the argmax.

use rand::Rng;

use super::request::SamplingParams;
use super::types::TokenId;

/// Sample one token id from full-precision logits.
///
/// `prior_tokens` are the positions already seen for this request; the
/// repetition penalty divides their positive logits and multiplies their
/// negative logits by the penalty. Ties always resolve to the lower index.
pub fn sample<R: Rng + ?Sized>(
    logits: &[f32],
    prior_tokens: &[TokenId],
    params: &SamplingParams,
    rng: &mut R,
) -> TokenId {
    debug_assert!(!logits.is_empty());
    let mut logits = logits.to_vec();

    if params.repetition_penalty > 1.0 {
        apply_repetition_penalty(&mut logits, prior_tokens, params.repetition_penalty);
    }

    if params.temperature == 0.0 {
        return argmax(&logits);
    }

    for l in logits.iter_mut() {
        *l /= params.temperature;
    }

    // Sort descending by logit, lower index first among equals.
    let mut candidates: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    if params.top_k > 0 {
        candidates.truncate(params.top_k);
    }

    // Softmax over the surviving candidates, max-subtracted for stability.
    let max_logit = candidates[0].1;
    let mut probs: Vec<(usize, f32)> = candidates
        .iter()
        .map(|&(i, l)| (i, (l - max_logit).exp()))
        .collect();
    let sum: f32 = probs.iter().map(|p| p.1).sum();
    for p in probs.iter_mut() {
        p.1 /= sum.max(f32::MIN_POSITIVE);
    }

    if params.top_p < 1.0 {
        let mut cumulative = 0.0_f32;
        let mut keep = 0;
        for &(_, p) in &probs {
            cumulative += p;
            keep += 1;
            if cumulative >= params.top_p {
                break;
            }
        }
        // Always keep at least one token.
        probs.truncate(keep.max(1));
        let z: f32 = probs.iter().map(|p| p.1).sum();
        for p in probs.iter_mut() {
            p.1 /= z.max(f32::MIN_POSITIVE);
        }
    }

    let draw: f32 = rng.gen();
    let mut cumulative = 0.0_f32;
    for &(i, p) in &probs {
        cumulative += p;
        if draw <= cumulative {
            return i as TokenId;
        }
    }
    probs[0].0 as TokenId
}

/// Divide positive logits and multiply negative logits by the penalty at
/// every previously seen position.
fn apply_repetition_penalty(logits: &mut [f32], prior_tokens: &[TokenId], penalty: f32) {
    for &token in prior_tokens {
        let Some(l) = logits.get_mut(token as usize) else {
            continue;
        };
        if *l > 0.0 {
            *l /= penalty;
        } else {
            *l *= penalty;
        }
    }
}

/// Index of the highest logit; the lower index wins ties.
pub fn argmax(logits: &[f32]) -> TokenId {
    let mut best = 0;
    for (i, &l) in logits.iter().enumerate() {
        if l > logits[best] {
            best = i;
        }
    }
    best as TokenId
}
