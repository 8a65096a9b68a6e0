//! The explanatory side-panel content: a markdown document fetched once at
//! startup and parsed into a heading/text/table tree. Display is the page's
//! concern; this module only produces the tree.

/// One node of the parsed document. Headings nest by level (1-4); text and
/// tables attach to the nearest open heading.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentNode {
    Heading {
        level: u8,
        content: String,
        children: Vec<ContentNode>,
    },
    Text {
        content: String,
    },
    Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    },
}

pub fn parse_markdown(input: &str) -> Vec<ContentNode> {
    let mut root = Vec::new();
    let mut stack: Vec<ContentNode> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();

    let lines: Vec<&str> = input.lines().collect();
    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim();
        if let Some((level, title)) = heading_of(trimmed) {
            flush_paragraph(&mut root, &mut stack, &mut paragraph);
            close_headings(&mut root, &mut stack, level);
            stack.push(ContentNode::Heading {
                level,
                content: title.to_string(),
                children: Vec::new(),
            });
            i += 1;
        } else if trimmed.starts_with('|') {
            flush_paragraph(&mut root, &mut stack, &mut paragraph);
            let mut block = Vec::new();
            while i < lines.len() && lines[i].trim().starts_with('|') {
                block.push(lines[i].trim());
                i += 1;
            }
            if let Some(table) = parse_table(&block) {
                append(&mut root, &mut stack, table);
            }
        } else if trimmed.is_empty() {
            flush_paragraph(&mut root, &mut stack, &mut paragraph);
            i += 1;
        } else {
            paragraph.push(trimmed);
            i += 1;
        }
    }
    flush_paragraph(&mut root, &mut stack, &mut paragraph);
    close_headings(&mut root, &mut stack, 0);
    root
}

fn heading_of(line: &str) -> Option<(u8, &str)> {
    let level = line.bytes().take_while(|&b| b == b'#').count();
    if !(1..=4).contains(&level) {
        return None;
    }
    let rest = &line[level..];
    rest.strip_prefix(' ').map(|title| (level as u8, title.trim()))
}

fn parse_table(block: &[&str]) -> Option<ContentNode> {
    let headers = split_cells(block.first()?);
    if headers.is_empty() {
        return None;
    }
    let body = match block.get(1) {
        Some(line) if is_separator(line) => &block[2..],
        _ => &block[1..],
    };
    let rows = body.iter().map(|line| split_cells(line)).collect();
    Some(ContentNode::Table { headers, rows })
}

fn is_separator(line: &str) -> bool {
    line.contains('-') && line.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn split_cells(line: &str) -> Vec<String> {
    line.trim()
        .trim_start_matches('|')
        .trim_end_matches('|')
        .split('|')
        .map(|cell| cell.trim().to_string())
        .collect()
}

/// Pop open headings with level >= `level`, attaching each to its parent.
fn close_headings(root: &mut Vec<ContentNode>, stack: &mut Vec<ContentNode>, level: u8) {
    while let Some(ContentNode::Heading { level: open, .. }) = stack.last() {
        if level != 0 && *open < level {
            break;
        }
        let node = stack.pop().expect("stack is non-empty");
        append(root, stack, node);
    }
}

fn flush_paragraph(
    root: &mut Vec<ContentNode>,
    stack: &mut Vec<ContentNode>,
    paragraph: &mut Vec<&str>,
) {
    if paragraph.is_empty() {
        return;
    }
    let content = paragraph.join("\n");
    paragraph.clear();
    append(root, stack, ContentNode::Text { content });
}

fn append(root: &mut Vec<ContentNode>, stack: &mut Vec<ContentNode>, node: ContentNode) {
    match stack.last_mut() {
        Some(ContentNode::Heading { children, .. }) => children.push(node),
        _ => root.push(node),
    }
}

/// Fetch the document over the page's origin. Called once at startup.
#[cfg(target_arch = "wasm32")]
pub async fn fetch_content(url: &str) -> Result<String, anyhow::Error> {
    use wasm_bindgen::JsCast;
    use wasm_bindgen_futures::JsFuture;

    let window = web_sys::window().ok_or_else(|| anyhow::anyhow!("no window"))?;
    let response = JsFuture::from(window.fetch_with_str(url))
        .await
        .map_err(|e| anyhow::anyhow!("fetch of {url} failed: {e:?}"))?;
    let response: web_sys::Response = response
        .dyn_into()
        .map_err(|_| anyhow::anyhow!("fetch did not produce a Response"))?;
    if !response.ok() {
        anyhow::bail!("fetch of {url} failed with status {}", response.status());
    }
    let body = response
        .text()
        .map_err(|e| anyhow::anyhow!("reading body failed: {e:?}"))?;
    let text = JsFuture::from(body)
        .await
        .map_err(|e| anyhow::anyhow!("reading body failed: {e:?}"))?;
    text.as_string()
        .ok_or_else(|| anyhow::anyhow!("body was not text"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_nest_by_level() {
        let doc = "# Ising model\n\nIntro.\n\n## Phase transition\n\nNear T_c.\n\n## Topologies\n\n# Appendix\n";
        let nodes = parse_markdown(doc);
        assert_eq!(nodes.len(), 2);
        let ContentNode::Heading { level, content, children } = &nodes[0] else {
            panic!("expected heading");
        };
        assert_eq!((*level, content.as_str()), (1, "Ising model"));
        // Intro text plus two subsections.
        assert_eq!(children.len(), 3);
        assert_eq!(
            children[0],
            ContentNode::Text {
                content: "Intro.".to_string()
            }
        );
        assert!(matches!(
            &children[1],
            ContentNode::Heading { level: 2, children, .. } if children.len() == 1
        ));
        assert!(matches!(&nodes[1], ContentNode::Heading { level: 1, .. }));
    }

    #[test]
    fn tables_split_headers_and_rows() {
        let doc = "| T | Phase |\n|---|-------|\n| 1.0 | ordered |\n| 4.0 | disordered |\n";
        let nodes = parse_markdown(doc);
        assert_eq!(nodes.len(), 1);
        let ContentNode::Table { headers, rows } = &nodes[0] else {
            panic!("expected table");
        };
        assert_eq!(headers, &["T", "Phase"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["4.0", "disordered"]);
    }

    #[test]
    fn consecutive_lines_form_one_paragraph() {
        let nodes = parse_markdown("line one\nline two\n\nline three\n");
        assert_eq!(
            nodes,
            vec![
                ContentNode::Text {
                    content: "line one\nline two".to_string()
                },
                ContentNode::Text {
                    content: "line three".to_string()
                },
            ]
        );
    }

    #[test]
    fn five_hashes_is_text_not_heading() {
        let nodes = parse_markdown("##### too deep\n");
        assert!(matches!(&nodes[0], ContentNode::Text { .. }));
    }
}
