//! Splits an accumulating text buffer into ready-to-speak phrases.
//!
//! The generator produces text in small deltas; synthesizing only at the end
//! of the response would add seconds of latency before the first audio. This
//! module cuts the buffer at sentence boundaries as soon as they appear, and
//! caps boundary-less runs at a fixed word count so time-to-first-audio stays
//! bounded even for rambling output.

/// Markers that end a phrase outright.
const STRONG_BOUNDARIES: [&str; 4] = [". ", "? ", "! ", "\n"];

/// Word cap for text with no sentence boundary in sight.
pub const MAX_PHRASE_WORDS: usize = 18;

/// Splits `buffer` into phrases ready for synthesis plus the residual text
/// that should wait for more input.
///
/// The buffer is cut at the *earliest* occurrence of any strong boundary, and
/// scanning restarts from the remainder after every cut, so interleaved
/// markers come out in textual order. If no boundary remains but at least
/// [`MAX_PHRASE_WORDS`] words do, the first [`MAX_PHRASE_WORDS`] words are
/// emitted as one phrase.
///
/// Pure and stateless: feeding the residual of one call (plus new input) back
/// in never duplicates or drops text.
pub fn segment(buffer: &str) -> (Vec<String>, String) {
    let mut phrases = Vec::new();
    let mut working = buffer;

    // Rescan from the top after every cut: a later ". " must not win over an
    // earlier "? ".
    while let Some((idx, sep)) = earliest_boundary(working) {
        let phrase = working[..idx + sep.len()].trim();
        if !phrase.is_empty() {
            phrases.push(phrase.to_string());
        }
        working = &working[idx + sep.len()..];
    }

    let words: Vec<&str> = working.split_whitespace().collect();
    if words.len() >= MAX_PHRASE_WORDS {
        let phrase = words[..MAX_PHRASE_WORDS].join(" ");
        let rest = words[MAX_PHRASE_WORDS..].join(" ");
        if !phrase.is_empty() {
            phrases.push(phrase);
        }
        return (phrases, rest);
    }

    (phrases, working.to_string())
}

fn earliest_boundary(text: &str) -> Option<(usize, &'static str)> {
    STRONG_BOUNDARIES
        .iter()
        .filter_map(|sep| text.find(sep).map(|idx| (idx, *sep)))
        .min_by_key(|(idx, _)| *idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sentence_yields_one_phrase() {
        let (phrases, rest) = segment("Hello there. ");
        assert_eq!(phrases, vec!["Hello there."]);
        assert_eq!(rest, "");
    }

    #[test]
    fn no_boundary_short_text_stays_in_residual() {
        let (phrases, rest) = segment("still thinking about");
        assert!(phrases.is_empty());
        assert_eq!(rest, "still thinking about");
    }

    #[test]
    fn boundaries_cut_in_textual_order() {
        let (phrases, rest) = segment("Really? Yes. Good!");
        assert_eq!(phrases, vec!["Really?", "Yes."]);
        assert_eq!(rest, "Good!");
    }

    #[test]
    fn newline_is_a_strong_boundary() {
        let (phrases, rest) = segment("line one\nline two");
        assert_eq!(phrases, vec!["line one"]);
        assert_eq!(rest, "line two");
    }

    #[test]
    fn long_run_is_cut_at_word_cap() {
        let input = (1..=30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let (phrases, rest) = segment(&input);
        assert_eq!(phrases.len(), 1);
        assert_eq!(phrases[0].split_whitespace().count(), MAX_PHRASE_WORDS);
        assert_eq!(rest.split_whitespace().count(), 12);
    }

    #[test]
    fn exactly_seventeen_words_waits_for_more() {
        let input = (1..=17).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let (phrases, rest) = segment(&input);
        assert!(phrases.is_empty());
        assert_eq!(rest, input);
    }

    #[test]
    fn no_text_lost_across_incremental_feeds() {
        // Simulate the pipeline: feed deltas one at a time, re-segmenting the
        // residual each round, and check every word comes out exactly once.
        let deltas = ["Well now. Let me s", "ee? I think", " so!\nDone. tail"];
        let mut residual = String::new();
        let mut spoken = Vec::new();
        for delta in deltas {
            residual.push_str(delta);
            let (phrases, rest) = segment(&residual);
            spoken.extend(phrases);
            residual = rest;
        }
        spoken.push(residual);

        let expected = "Well now. Let me see? I think so!\nDone. tail";
        let got: Vec<&str> = spoken.iter().flat_map(|p| p.split_whitespace()).collect();
        let want: Vec<&str> = expected
            .split(|c: char| c.is_whitespace())
            .filter(|w| !w.is_empty())
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn whitespace_only_phrase_is_dropped() {
        let (phrases, rest) = segment("\n  \nHi. ");
        assert_eq!(phrases, vec!["Hi."]);
        assert_eq!(rest, "");
    }
}
