use std::collections::{HashMap, HashSet};

use crate::storage::models::ImageDescription;

/// Splice each description into the markdown in place of its `[anchor]`. A
/// description whose anchor does not appear is appended as its own paragraph so
/// nothing is lost.
///
/// The markdown is scanned once, left to right; inserted description text is never
/// rescanned, so a description that mentions another anchor stays as written.
pub fn merge_descriptions(markdown: &str, descriptions: &[ImageDescription]) -> String {
    let by_anchor: HashMap<&str, &str> = descriptions
        .iter()
        .map(|d| (d.position_anchor.as_str(), d.description_text.as_str()))
        .collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut merged = String::with_capacity(markdown.len());
    let mut rest = markdown;

    while let Some(open) = rest.find('[') {
        merged.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let anchor = after.find(']').map(|close| &after[..close]);

        match anchor.and_then(|a| by_anchor.get_key_value(a)) {
            Some((anchor, text)) => {
                merged.push_str(text);
                placed.insert(*anchor);
                rest = &after[anchor.len() + 1..];
            }
            None => {
                merged.push('[');
                rest = after;
            }
        }
    }
    merged.push_str(rest);

    for orphan in descriptions
        .iter()
        .filter(|d| !placed.contains(d.position_anchor.as_str()))
    {
        if !merged.is_empty() && !merged.ends_with("\n\n") {
            merged.push_str(if merged.ends_with('\n') { "\n" } else { "\n\n" });
        }
        merged.push_str(&orphan.description_text);
        merged.push('\n');
    }

    merged
}
