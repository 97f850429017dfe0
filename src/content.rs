//! Cheap content estimate used by the thin-content check.
//!
//! This is not extraction: it only counts visible words and how much of the
//! visible text sits inside links.

use scraper::{Html, Node};
use serde::{Deserialize, Serialize};

/// Elements whose text is never visible content.
const INVISIBLE: &[&str] = &["script", "style", "noscript", "template", "svg", "head"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentEstimate {
    pub word_count: usize,
    /// Link text characters over visible text characters, in [0, 1].
    /// `None` when the page has no visible text.
    pub link_density: Option<f64>,
}

impl ContentEstimate {
    /// Estimate from an HTML document.
    pub fn from_html(html: &str) -> Self {
        let document = Html::parse_document(html);

        let mut words = 0usize;
        let mut text_chars = 0usize;
        let mut link_chars = 0usize;

        for node in document.tree.root().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };

            let mut in_link = false;
            let mut hidden = false;
            for ancestor in node.ancestors() {
                if let Node::Element(element) = ancestor.value() {
                    match element.name() {
                        "a" => in_link = true,
                        name if INVISIBLE.contains(&name) => {
                            hidden = true;
                            break;
                        }
                        _ => {}
                    }
                }
            }
            if hidden {
                continue;
            }

            let visible = text.chars().filter(|c| !c.is_whitespace()).count();
            if visible == 0 {
                continue;
            }
            words += text.split_whitespace().count();
            text_chars += visible;
            if in_link {
                link_chars += visible;
            }
        }

        let link_density = if text_chars == 0 {
            None
        } else {
            Some((link_chars as f64 / text_chars as f64).clamp(0.0, 1.0))
        };

        Self {
            word_count: words,
            link_density,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_article_has_low_link_density() {
        let html = r#"<html><head><title>Careers</title><script>var x = "ignored words here";</script></head>
            <body><nav><a href="/">Home</a></nav>
            <article><p>We build reliable systems for customers around the world and hire engineers.</p></article>
            </body></html>"#;
        let estimate = ContentEstimate::from_html(html);
        assert_eq!(estimate.word_count, 13);
        assert!(estimate.link_density.unwrap() < 0.1);
    }

    #[test]
    fn test_navigation_page_is_link_heavy() {
        let html = r#"<body><ul>
            <li><a href="/a">Products</a></li><li><a href="/b">Solutions</a></li>
            <li><a href="/c">Investors</a></li><li><a href="/d">Contact</a></li>
            </ul><p>Menu</p></body>"#;
        let estimate = ContentEstimate::from_html(html);
        assert_eq!(estimate.word_count, 5);
        assert!(estimate.link_density.unwrap() > 0.8);
    }

    #[test]
    fn test_empty_document_has_no_density() {
        let estimate = ContentEstimate::from_html("<html><body>   </body></html>");
        assert_eq!(estimate.word_count, 0);
        assert_eq!(estimate.link_density, None);
    }

    #[test]
    fn test_style_and_noscript_ignored() {
        let html = "<body><style>.a{color:red}</style><noscript>Enable JavaScript</noscript><p>one two</p></body>";
        assert_eq!(ContentEstimate::from_html(html).word_count, 2);
    }
}
