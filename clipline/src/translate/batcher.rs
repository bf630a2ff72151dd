//! Token-aware chunking of segments for batch translation.

use clip_types::Segment;

use crate::config::TranslationConfig;

/// A batch of segments sent to the LLM in one request.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Trailing segments of the previous chunk, included for context only.
    pub context: Vec<Segment>,
    /// Segments to actually translate.
    pub segments: Vec<Segment>,
    /// A single segment that alone exceeds the token budget. It is never
    /// split; downstream flags it instead.
    pub oversized: bool,
}

impl Chunk {
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Estimate the token cost of a text with the mixed-script heuristic:
/// ideographic runs cost `1.5 x chars`, everything else `1.3 x words`.
pub fn estimate_tokens(text: &str) -> usize {
    let mut total = 0.0f64;
    let mut run = String::new();
    let mut run_ideographic = None::<bool>;

    for ch in text.chars() {
        let ideographic = is_ideographic(ch);
        match run_ideographic {
            Some(current) if current == ideographic => run.push(ch),
            Some(current) => {
                total += run_cost(&run, current);
                run.clear();
                run.push(ch);
                run_ideographic = Some(ideographic);
            }
            None => {
                run.push(ch);
                run_ideographic = Some(ideographic);
            }
        }
    }
    if let Some(current) = run_ideographic {
        total += run_cost(&run, current);
    }

    total.ceil() as usize
}

fn run_cost(run: &str, ideographic: bool) -> f64 {
    if ideographic {
        run.chars().count() as f64 * 1.5
    } else {
        run.split_whitespace().count() as f64 * 1.3
    }
}

/// CJK ideographs, kana and hangul count as ideographic script.
fn is_ideographic(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{30FF}'   // hiragana + katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified
        | '\u{F900}'..='\u{FAFF}' // CJK compatibility
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
    )
}

/// Estimated cost of one segment inside a batch prompt.
pub fn segment_tokens(segment: &Segment) -> usize {
    // A small per-line overhead covers the id prefix and framing.
    estimate_tokens(&segment.text) + 4
}

/// Partition segments into chunks bounded by `max_tokens_per_request`.
///
/// Each chunk after the first carries the last `overlap_segments` segments
/// of the previous chunk as context. A segment that alone exceeds the
/// budget becomes its own chunk, flagged oversized.
pub fn chunk_segments(segments: &[Segment], config: &TranslationConfig) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = Chunk::default();
    let mut current_tokens = 0usize;

    let finish = |chunks: &mut Vec<Chunk>, current: &mut Chunk| {
        if !current.is_empty() {
            chunks.push(std::mem::take(current));
        }
    };

    for segment in segments {
        let cost = segment_tokens(segment);

        if cost > config.max_tokens_per_request {
            finish(&mut chunks, &mut current);
            current_tokens = 0;
            chunks.push(Chunk {
                context: overlap_of(&chunks, config.overlap_segments),
                segments: vec![segment.clone()],
                oversized: true,
            });
            continue;
        }

        if current_tokens + cost > config.max_tokens_per_request && !current.is_empty() {
            finish(&mut chunks, &mut current);
            current_tokens = 0;
        }

        if current.is_empty() {
            current.context = overlap_of(&chunks, config.overlap_segments);
        }
        current.segments.push(segment.clone());
        current_tokens += cost;
    }
    finish(&mut chunks, &mut current);

    chunks
}

/// Trailing segments of the previous chunk, used as context-only material.
fn overlap_of(chunks: &[Chunk], overlap: usize) -> Vec<Segment> {
    match chunks.last() {
        Some(prev) if overlap > 0 => {
            let skip = prev.segments.len().saturating_sub(overlap);
            prev.segments[skip..].to_vec()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(id: u32, text: &str) -> Segment {
        Segment {
            id,
            start_s: id as f64,
            end_s: id as f64 + 1.0,
            text: text.to_string(),
            confidence: 0.9,
            words: Vec::new(),
            speaker: None,
        }
    }

    fn config(max_tokens: usize, overlap: usize) -> TranslationConfig {
        TranslationConfig {
            max_tokens_per_request: max_tokens,
            overlap_segments: overlap,
            ..TranslationConfig::default()
        }
    }

    #[test]
    fn test_estimate_latin_by_words() {
        // 4 words * 1.3 = 5.2 -> 6
        assert_eq!(estimate_tokens("the quick brown fox"), 6);
    }

    #[test]
    fn test_estimate_ideographic_by_chars() {
        // 5 chars * 1.5 = 7.5 -> 8
        assert_eq!(estimate_tokens("こんにちは"), 8);
    }

    #[test]
    fn test_estimate_mixed_script() {
        // "hello " run: 1 word * 1.3; "世界" run: 2 * 1.5 = 3.0 -> ceil(4.3) = 5
        assert_eq!(estimate_tokens("hello 世界"), 5);
    }

    #[test]
    fn test_chunking_respects_budget() {
        let segments: Vec<Segment> = (1..=10)
            .map(|i| segment(i, "some words in a segment here"))
            .collect();
        let cfg = config(30, 0);
        let chunks = chunk_segments(&segments, &cfg);

        assert!(chunks.len() > 1);
        for chunk in &chunks {
            let total: usize = chunk.segments.iter().map(segment_tokens).sum();
            assert!(total <= 30, "chunk exceeded budget: {total}");
        }
    }

    #[test]
    fn test_chunk_ids_cover_input_in_order() {
        let segments: Vec<Segment> = (1..=25)
            .map(|i| segment(i, "alpha beta gamma delta"))
            .collect();
        let chunks = chunk_segments(&segments, &config(40, 2));

        let ids: Vec<u32> = chunks
            .iter()
            .flat_map(|c| c.segments.iter().map(|s| s.id))
            .collect();
        let expected: Vec<u32> = (1..=25).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_overlap_carried_as_context() {
        let segments: Vec<Segment> = (1..=8)
            .map(|i| segment(i, "one two three four five six"))
            .collect();
        let chunks = chunk_segments(&segments, &config(30, 2));
        assert!(chunks.len() >= 2);

        let first_ids: Vec<u32> = chunks[0].segments.iter().map(|s| s.id).collect();
        let context_ids: Vec<u32> = chunks[1].context.iter().map(|s| s.id).collect();
        let expected: Vec<u32> = first_ids[first_ids.len().saturating_sub(2)..].to_vec();
        assert_eq!(context_ids, expected);
    }

    #[test]
    fn test_oversized_segment_gets_own_chunk() {
        let huge = "word ".repeat(200);
        let segments = vec![
            segment(1, "short text"),
            segment(2, &huge),
            segment(3, "short text"),
        ];
        let chunks = chunk_segments(&segments, &config(50, 2));

        let oversized: Vec<&Chunk> = chunks.iter().filter(|c| c.oversized).collect();
        assert_eq!(oversized.len(), 1);
        assert_eq!(oversized[0].segments.len(), 1);
        assert_eq!(oversized[0].segments[0].id, 2);
    }

    #[test]
    fn test_empty_input() {
        assert!(chunk_segments(&[], &config(100, 2)).is_empty());
    }
}
