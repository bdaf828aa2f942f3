//! A small `${tag}` substitution engine used for tag templates (§3 `key`,
//! `value`) and action-name templates (§4.3 step 1). An unknown tag name
//! substitutes to empty string rather than erroring — that is itself
//! load-bearing: the tagging step treats an empty key or value as "skip",
//! not a failure (§9 "Tag substitution side effects").

use crate::tags::TagStore;

#[must_use]
pub fn substitute(template: &str, tags: &TagStore) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(end) = template[i + 2..].find('}') {
                let name = &template[i + 2..i + 2 + end];
                if let Some(value) = tags.get(name) {
                    out.push_str(value);
                }
                i += 2 + end + 1;
                continue;
            }
        }
        let ch = template[i..].chars().next().expect("i < bytes.len() implies a char starts here");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_tags() {
        let mut tags = TagStore::new();
        tags.insert("user", "alice");
        assert_eq!(substitute("mbox-${user}", &tags), "mbox-alice");
    }

    #[test]
    fn unknown_tag_substitutes_to_empty() {
        let tags = TagStore::new();
        assert_eq!(substitute("${missing}-suffix", &tags), "-suffix");
    }

    #[test]
    fn template_with_no_placeholders_is_unchanged() {
        let tags = TagStore::new();
        assert_eq!(substitute("keep", &tags), "keep");
    }

    #[test]
    fn unterminated_placeholder_is_left_verbatim() {
        let tags = TagStore::new();
        assert_eq!(substitute("${oops", &tags), "${oops");
    }
}
