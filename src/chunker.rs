//! Troceado estructural de documentos por encabezados markdown.
//!
//! Cada encabezado (`#` .. `######` seguido de espacio) abre una sección nueva;
//! los encabezados dentro de bloques de código no cuentan. El orden del
//! documento se conserva. Una sección demasiado larga se parte además por
//! líneas para no superar `max_chars`.

use crate::models::{Chunk, Document};

/// Trocea todos los documentos, numerando los chunks de forma global.
pub fn split_documents(docs: &[Document], max_chars: usize) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for doc in docs {
        for section in parse_sections(&doc.text) {
            let mut metadata = doc.metadata.clone();
            if !section.header_path.is_empty() {
                metadata.insert(
                    "header_path".to_string(),
                    format!("/{}/", section.header_path.join("/")),
                );
            }
            for piece in split_long(&section.text, max_chars) {
                chunks.push(Chunk {
                    index: chunks.len(),
                    text: piece,
                    metadata: metadata.clone(),
                });
            }
        }
    }
    chunks
}

#[derive(Debug, PartialEq)]
struct Section {
    /// Títulos de los encabezados padre (sin incluir el propio).
    header_path: Vec<String>,
    text: String,
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&level) {
        return None;
    }
    let rest = &trimmed[level..];
    if !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }
    Some((level, rest.trim()))
}

fn parse_sections(text: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    // (nivel, título) de los encabezados abiertos
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut current = String::new();
    let mut current_path: Vec<String> = Vec::new();
    let mut in_code_block = false;

    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let parsed = if in_code_block { None } else { heading(line) };
        if let Some((level, title)) = parsed {
            push_section(&mut sections, &current_path, &current);
            current.clear();

            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            current_path = stack.iter().map(|(_, t)| t.clone()).collect();
            stack.push((level, title.to_string()));
        }

        current.push_str(line);
        current.push('\n');
    }
    push_section(&mut sections, &current_path, &current);
    sections
}

fn push_section(sections: &mut Vec<Section>, path: &[String], text: &str) {
    let text = text.trim();
    if !text.is_empty() {
        sections.push(Section {
            header_path: path.to_vec(),
            text: text.to_string(),
        });
    }
}

/// Parte por líneas sin superar `max_chars` (salvo líneas que ya lo superan).
fn split_long(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;
    for line in text.lines() {
        let line_len = line.chars().count();
        if current_len > 0 && current_len + 1 + line_len > max_chars {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if current_len > 0 {
            current.push('\n');
            current_len += 1;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.trim().is_empty() {
        pieces.push(current);
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_without_headings_is_one_chunk() {
        let docs = vec![Document::new("product,qty\nWidget,5\nGadget,3\n")];
        let chunks = split_documents(&docs, 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "product,qty\nWidget,5\nGadget,3");
        assert!(chunks[0].metadata.is_empty());
    }

    #[test]
    fn headings_open_sections_in_order() {
        let text = "intro\n# A\none\n## A1\ntwo\n# B\nthree\n";
        let chunks = split_documents(&[Document::new(text)], 1000);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["intro", "# A\none", "## A1\ntwo", "# B\nthree"]);
        assert_eq!(chunks[2].metadata["header_path"], "/A/");
        assert!(!chunks[3].metadata.contains_key("header_path"));
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn headings_in_code_blocks_are_ignored() {
        let text = "# Doc\n```\n# not a heading\n```\nend\n";
        let chunks = split_documents(&[Document::new(text)], 1000);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("# not a heading"));
    }

    #[test]
    fn hashtags_without_space_are_text() {
        assert!(heading("#hashtag").is_none());
        assert!(heading("####### seven").is_none());
        assert_eq!(heading("### Title "), Some((3, "Title")));
    }

    #[test]
    fn long_sections_are_split_by_lines() {
        let text = "aaaa\nbbbb\ncccc\ndddd";
        let pieces = split_long(text, 9);
        assert_eq!(pieces, vec!["aaaa\nbbbb", "cccc\ndddd"]);
    }

    #[test]
    fn document_metadata_is_inherited() {
        let doc = Document::new("## Hoja1\n\n| a |\n|---|\n| 1 |").with_metadata("sheet_name", "Hoja1");
        let chunks = split_documents(&[doc], 1000);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata["sheet_name"], "Hoja1");
    }
}
