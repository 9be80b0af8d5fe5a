//! Restoration prompt enhancer.

use crate::pipeline::classify::{DegradationKind, DegradationMap};

pub const MAX_PROMPT_LEN: usize = 1_000;
const TRUNCATE_TO: usize = 950;
const SELECT_THRESHOLD: f32 = 0.3;
const MAX_SELECTED: usize = 3;
const HIGH_SEVERITY: f32 = 0.7;

const QUALITY_GUIDANCE: &str =
    "Preserve natural texture, film grain where authentic, and faithful colors; never add or remove content.";
const SEVERITY_HINT: &str =
    "Damage is severe; apply strong correction carefully to avoid introducing artifacts.";
const SUBTLE_FALLBACK: &str =
    "Subtle enhancement only: gently improve overall clarity and tone without altering content.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Low,
    Medium,
    High,
}

fn severity(score: f32) -> Severity {
    if score < 0.5 {
        Severity::Low
    } else if score < HIGH_SEVERITY {
        Severity::Medium
    } else {
        Severity::High
    }
}

fn fragment(kind: DegradationKind, severity: Severity) -> &'static str {
    use DegradationKind::*;
    use Severity::*;
    match (kind, severity) {
        (Blur, Low) => "slightly sharpen soft details",
        (Blur, Medium) => "recover focus and sharpen blurred regions",
        (Blur, High) => "reconstruct sharpness across the heavily blurred image",
        (Noise, Low) => "reduce light sensor noise",
        (Noise, Medium) => "remove visible noise while keeping fine detail",
        (Noise, High) => "aggressively denoise the heavily grainy image",
        (LowLight, Low) => "lift shadows slightly",
        (LowLight, Medium) => "brighten the underexposed image and recover shadow detail",
        (LowLight, High) => "rescue the very dark exposure and rebuild shadow regions",
        (Compression, Low) => "smooth minor compression artifacts",
        (Compression, Medium) => "remove blocky compression artifacts",
        (Compression, High) => "repair severe compression blocking and banding",
        (Scratch, Low) => "heal a few small scratches",
        (Scratch, Medium) => "remove scratches and surface damage",
        (Scratch, High) => "repair extensive scratches, tears, and surface damage",
        (Fade, Low) => "gently revive faded tones",
        (Fade, Medium) => "restore faded colors and contrast",
        (Fade, High) => "rebuild color and contrast in the badly faded image",
        (ColorShift, Low) => "neutralize a slight color cast",
        (ColorShift, Medium) => "correct the color cast and rebalance channels",
        (ColorShift, High) => "correct the strong color shift and restore natural balance",
    }
}

/// Compose the bounded restoration instruction from the degradation map and
/// the optional user prompt.
pub fn enhance_prompt(map: &DegradationMap, user_prompt: Option<&str>) -> String {
    let mut selected: Vec<(DegradationKind, f32)> = map
        .scores()
        .iter()
        .filter(|(_, score)| **score > SELECT_THRESHOLD)
        .map(|(kind, score)| (*kind, *score))
        .collect();
    selected.sort_by(|a, b| b.1.total_cmp(&a.1));
    selected.truncate(MAX_SELECTED);

    let user_prompt = user_prompt.map(str::trim).filter(|p| !p.is_empty());

    let mut parts: Vec<String> = Vec::new();
    if let Some(prompt) = user_prompt {
        parts.push(format!("User request: {prompt}."));
    }
    if selected.is_empty() {
        if user_prompt.is_none() {
            parts.push(SUBTLE_FALLBACK.to_string());
        }
    } else {
        let fragments: Vec<&str> = selected
            .iter()
            .map(|(kind, score)| fragment(*kind, severity(*score)))
            .collect();
        parts.push(format!("Technical restoration: {}.", fragments.join("; ")));
    }
    parts.push(QUALITY_GUIDANCE.to_string());
    if selected.iter().any(|(_, score)| *score >= HIGH_SEVERITY) {
        parts.push(SEVERITY_HINT.to_string());
    }

    let composed = parts.join(" ");
    if composed.len() <= MAX_PROMPT_LEN {
        return composed;
    }
    let mut cut = TRUNCATE_TO;
    while !composed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &composed[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(scores: &[(DegradationKind, f32)]) -> DegradationMap {
        DegradationMap::from_scores(scores.iter().copied())
    }

    #[test]
    fn selects_top_three_by_score() {
        let map = map(&[
            (DegradationKind::Blur, 0.4),
            (DegradationKind::Noise, 0.9),
            (DegradationKind::Scratch, 0.6),
            (DegradationKind::Fade, 0.5),
        ]);
        let prompt = enhance_prompt(&map, None);
        assert!(prompt.contains("aggressively denoise"));
        assert!(prompt.contains("remove scratches"));
        assert!(prompt.contains("restore faded colors"));
        // Fourth-ranked blur is dropped by the top-3 cap.
        assert!(!prompt.contains("sharpen"));
        // Noise is high severity, so the hint appears.
        assert!(prompt.contains("Damage is severe"));
    }

    #[test]
    fn threshold_excludes_weak_signals() {
        let map = map(&[(DegradationKind::Blur, 0.3), (DegradationKind::Fade, 0.31)]);
        let prompt = enhance_prompt(&map, None);
        assert!(!prompt.contains("sharpen"), "0.3 is not above the threshold");
        assert!(prompt.contains("gently revive faded tones"));
    }

    #[test]
    fn clean_image_without_prompt_gets_subtle_fallback() {
        let prompt = enhance_prompt(&map(&[]), None);
        assert!(prompt.starts_with("Subtle enhancement only"));
        assert!(prompt.contains(QUALITY_GUIDANCE));
    }

    #[test]
    fn user_prompt_leads_the_composition() {
        let map = map(&[(DegradationKind::Scratch, 0.6)]);
        let prompt = enhance_prompt(&map, Some("  make grandma's portrait shine  "));
        assert!(prompt.starts_with("User request: make grandma's portrait shine."));
        assert!(prompt.contains("Technical restoration: remove scratches"));
    }

    #[test]
    fn blank_user_prompt_is_treated_as_absent() {
        let prompt = enhance_prompt(&map(&[]), Some("   "));
        assert!(prompt.starts_with("Subtle enhancement only"));
    }

    #[test]
    fn long_output_is_truncated_with_ellipsis() {
        let map = map(&[(DegradationKind::Scratch, 0.8)]);
        let long_request = "restore ".repeat(200);
        let prompt = enhance_prompt(&map, Some(&long_request));
        assert!(prompt.len() <= 954, "len = {}", prompt.len());
        assert!(prompt.ends_with('…'));
    }

    #[test]
    fn output_never_exceeds_the_cap() {
        let map = map(&[
            (DegradationKind::Blur, 0.8),
            (DegradationKind::Noise, 0.8),
            (DegradationKind::Scratch, 0.8),
        ]);
        let prompt = enhance_prompt(&map, Some(&"x".repeat(2_000)));
        assert!(prompt.len() <= MAX_PROMPT_LEN);
    }
}
