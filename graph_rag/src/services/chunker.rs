//! Section-aware text segmentation.
//!
//! Headers are detected per line: an ALL-CAPS run or a short TitleCase line
//! (at most 8 tokens) starts a new section; everything else accumulates into
//! the current section body, which begins as `Root`. Within a section,
//! blank-line-delimited paragraphs are grouped into chunks under an
//! estimated token budget (`len/4 + 1` per paragraph).

use lazy_static::lazy_static;
use regex::Regex;

pub const DEFAULT_MAX_TOKENS: usize = 450;

lazy_static! {
    static ref ALL_CAPS_HEADER: Regex = Regex::new(r"^[A-Z][A-Z \-/&+]{2,}$").unwrap();
    static ref TITLE_CASE_HEADER: Regex =
        Regex::new(r"^[A-Z][a-zA-Z]+(?:\s+[A-Z][a-zA-Z]+){0,5}$").unwrap();
    static ref NON_ALNUM: Regex = Regex::new(r"[^a-z0-9]+").unwrap();
}

/// Metadata record aligned with the chunk list by index.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMeta {
    pub section_id: String,
    pub section_title: String,
    pub local_index: usize,
    pub global_index: usize,
}

#[derive(Debug, Default)]
pub struct ChunkSet {
    pub chunks: Vec<String>,
    /// Empty when the fallback single-chunk path was taken.
    pub sections: Vec<ChunkMeta>,
}

pub struct Chunker;

impl Chunker {
    pub fn split(text: &str) -> ChunkSet {
        Self::split_with_budget(text, DEFAULT_MAX_TOKENS)
    }

    pub fn split_with_budget(text: &str, max_tokens: usize) -> ChunkSet {
        let mut sections: Vec<(String, Vec<String>)> = Vec::new();
        let mut current_title = "Root".to_string();
        let mut current_body: Vec<String> = Vec::new();

        for line in text.lines() {
            let raw = line.trim();
            if raw.is_empty() {
                current_body.push(String::new());
                continue;
            }
            if is_section_header(raw) {
                if current_body.iter().any(|l| !l.trim().is_empty()) {
                    sections.push((current_title.clone(), std::mem::take(&mut current_body)));
                } else {
                    current_body.clear();
                }
                current_title = title_case(raw);
                continue;
            }
            current_body.push(line.to_string());
        }
        if current_body.iter().any(|l| !l.trim().is_empty()) {
            sections.push((current_title, current_body));
        }

        let mut chunks = Vec::new();
        let mut metas = Vec::new();
        let mut global_index = 0usize;
        for (title, body_lines) in sections {
            let parts = chunk_paragraphs(&body_lines, max_tokens);
            if parts.is_empty() {
                continue;
            }
            let slug = slugify(&title);
            for (local_index, part) in parts.into_iter().enumerate() {
                chunks.push(part);
                metas.push(ChunkMeta {
                    section_id: slug.clone(),
                    section_title: title.clone(),
                    local_index,
                    global_index,
                });
                global_index += 1;
            }
        }

        if chunks.is_empty() {
            let body = text.trim();
            if body.is_empty() {
                return ChunkSet::default();
            }
            return ChunkSet {
                chunks: vec![body.to_string()],
                sections: Vec::new(),
            };
        }
        ChunkSet {
            chunks,
            sections: metas,
        }
    }
}

fn is_section_header(line: &str) -> bool {
    if line.split_whitespace().count() > 8 {
        return false;
    }
    ALL_CAPS_HEADER.is_match(line) || TITLE_CASE_HEADER.is_match(line)
}

/// Group blank-line-delimited paragraphs so the cumulative estimated token
/// count stays under the budget; a chunk is emitted when adding the next
/// paragraph would exceed it.
fn chunk_paragraphs(lines: &[String], max_tokens: usize) -> Vec<String> {
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line.trim_end());
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join("\n"));
    }

    let mut chunks = Vec::new();
    let mut buffer: Vec<String> = Vec::new();
    let mut token_estimate = 0usize;
    for paragraph in paragraphs {
        let tokens = estimate_tokens(&paragraph);
        if token_estimate + tokens > max_tokens && !buffer.is_empty() {
            chunks.push(buffer.join("\n"));
            buffer.clear();
            token_estimate = 0;
        }
        token_estimate += tokens;
        buffer.push(paragraph);
    }
    if !buffer.is_empty() {
        chunks.push(buffer.join("\n"));
    }
    chunks
}

pub fn estimate_tokens(text: &str) -> usize {
    text.len() / 4 + 1
}

pub fn slugify(title: &str) -> String {
    let lowered = title.to_lowercase();
    let slug = NON_ALNUM.replace_all(&lowered, "-");
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "section".to_string()
    } else {
        slug
    }
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_all_caps_and_title_case_headers() {
        assert!(is_section_header("WORK EXPERIENCE"));
        assert!(is_section_header("Machine Learning Projects"));
        assert!(!is_section_header("this is a plain sentence"));
        assert!(!is_section_header(
            "One Two Three Four Five Six Seven Eight Nine"
        ));
    }

    #[test]
    fn splits_into_sections_with_slugs() {
        let text = "INTRO\nFirst paragraph about things.\n\nEDUCATION\nStudied at a university.\n";
        let set = Chunker::split(text);
        assert_eq!(set.chunks.len(), 2);
        assert_eq!(set.sections[0].section_id, "intro");
        assert_eq!(set.sections[0].section_title, "Intro");
        assert_eq!(set.sections[1].section_id, "education");
        assert_eq!(set.sections[1].global_index, 1);
        assert_eq!(set.sections[1].local_index, 0);
    }

    #[test]
    fn body_before_any_header_lands_in_root() {
        let set = Chunker::split("just one plain line of text without headers at all, lowercase");
        assert_eq!(set.chunks.len(), 1);
        assert_eq!(set.sections[0].section_id, "root");
    }

    #[test]
    fn token_budget_splits_long_sections() {
        let para = "word ".repeat(200);
        let text = format!("SECTION ONE\n{}\n\n{}\n\n{}\n", para, para, para);
        let set = Chunker::split_with_budget(&text, 300);
        assert!(set.chunks.len() >= 2);
        let locals: Vec<usize> = set.sections.iter().map(|m| m.local_index).collect();
        assert_eq!(locals[0], 0);
        assert!(locals.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn empty_text_yields_nothing_and_is_deterministic() {
        assert!(Chunker::split("   \n \n").chunks.is_empty());
        let a = Chunker::split("INTRO\nalpha beta gamma.\n");
        let b = Chunker::split("INTRO\nalpha beta gamma.\n");
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(a.sections, b.sections);
    }

    #[test]
    fn slugify_strips_punctuation() {
        assert_eq!(slugify("Work & Experience / History"), "work-experience-history");
        assert_eq!(slugify("!!!"), "section");
    }
}
