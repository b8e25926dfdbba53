//! Exclusive XML Canonicalization 1.0, without comments.
//!
//! Only namespaces visibly utilized by an element (its own prefix and the
//! prefixes of its attributes) are rendered, plus any prefixes named in an
//! `InclusiveNamespaces` prefix list. Comments never reach this module since
//! the parser drops them.

use super::{Element, Node, NamespaceScope};

/// Algorithm identifier for Exclusive C14N without comments.
pub const EXCLUSIVE_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// Canonicalize `element` as an apex node.
///
/// `parent_scope` carries the namespace bindings in scope above the element,
/// so a detached subtree canonicalizes the same way it does inside its
/// document. `inclusive_prefixes` uses the `#default` token for the default
/// namespace.
pub fn canonicalize(
    element: &Element,
    parent_scope: &NamespaceScope,
    inclusive_prefixes: &[String],
) -> String {
    let inclusive: Vec<Option<&str>> = inclusive_prefixes
        .iter()
        .map(|p| if p == "#default" { None } else { Some(p.as_str()) })
        .collect();

    let mut out = String::new();
    write_element(element, parent_scope, &[], &inclusive, &mut out);
    out
}

/// A namespace binding already rendered by an output ancestor.
type Rendered = (Option<String>, String);

fn write_element(
    element: &Element,
    parent_scope: &NamespaceScope,
    rendered: &[Rendered],
    inclusive: &[Option<&str>],
    out: &mut String,
) {
    let scope = parent_scope.enter(element);

    let mut candidates: Vec<Option<&str>> = vec![element.prefix.as_deref()];
    for attr in &element.attributes {
        if let Some(prefix) = attr.prefix.as_deref()
            && prefix != "xml"
        {
            candidates.push(Some(prefix));
        }
    }
    for prefix in inclusive {
        if scope.resolve(*prefix).is_some() {
            candidates.push(*prefix);
        }
    }
    candidates.sort();
    candidates.dedup();

    let mut declarations: Vec<Rendered> = Vec::new();
    for prefix in candidates {
        let uri = scope.resolve(prefix).unwrap_or("");
        let previous = rendered
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, u)| u.as_str());
        let needed = match prefix {
            None => uri != previous.unwrap_or(""),
            Some(_) => !uri.is_empty() && previous != Some(uri),
        };
        if needed {
            declarations.push((prefix.map(str::to_string), uri.to_string()));
        }
    }
    // `None` orders before any `Some`, so the default namespace comes first.
    declarations.sort();

    let mut attributes: Vec<(&str, &str, String, &str)> = element
        .attributes
        .iter()
        .map(|attr| {
            let namespace = attr
                .prefix
                .as_deref()
                .and_then(|p| scope.resolve(Some(p)))
                .unwrap_or("");
            (namespace, attr.local_name.as_str(), attr.qualified_name(), attr.value.as_str())
        })
        .collect();
    attributes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let name = element.qualified_name();
    out.push('<');
    out.push_str(&name);
    for (prefix, uri) in &declarations {
        match prefix {
            Some(prefix) => {
                out.push_str(" xmlns:");
                out.push_str(prefix);
            }
            None => out.push_str(" xmlns"),
        }
        out.push_str("=\"");
        escape_attribute(uri, out);
        out.push('"');
    }
    for (_, _, qualified_name, value) in &attributes {
        out.push(' ');
        out.push_str(qualified_name);
        out.push_str("=\"");
        escape_attribute(value, out);
        out.push('"');
    }
    out.push('>');

    let mut child_rendered = rendered.to_vec();
    child_rendered.extend(declarations);

    for node in &element.children {
        match node {
            Node::Text(text) => escape_text(text, out),
            Node::Element(child) => write_element(child, &scope, &child_rendered, inclusive, out),
        }
    }

    out.push_str("</");
    out.push_str(&name);
    out.push('>');
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::parse;

    fn c14n(xml: &str) -> String {
        canonicalize(&parse(xml).unwrap(), &NamespaceScope::new(), &[])
    }

    #[test]
    fn test_empty_elements_expand_and_attributes_sort() {
        assert_eq!(
            c14n(r#"<a z="1" b='2' a="3"><e/></a>"#),
            r#"<a a="3" b="2" z="1"><e></e></a>"#
        );
    }

    #[test]
    fn test_unused_namespaces_are_dropped() {
        assert_eq!(
            c14n(r#"<p:a xmlns:p="urn:p" xmlns:unused="urn:u"><b/></p:a>"#),
            r#"<p:a xmlns:p="urn:p"><b></b></p:a>"#
        );
    }

    #[test]
    fn test_namespace_rendered_where_first_used() {
        assert_eq!(
            c14n(r#"<a xmlns:q="urn:q"><q:b><q:c/></q:b></a>"#),
            r#"<a><q:b xmlns:q="urn:q"><q:c></q:c></q:b></a>"#
        );
    }

    #[test]
    fn test_declarations_sorted_default_first() {
        assert_eq!(
            c14n(r#"<a xmlns:z="urn:z" xmlns="urn:d" xmlns:b="urn:b" z:x="1" b:y="2"/>"#),
            r#"<a xmlns="urn:d" xmlns:b="urn:b" xmlns:z="urn:z" b:y="2" z:x="1"></a>"#
        );
    }

    #[test]
    fn test_attributes_sorted_by_namespace_uri_then_name() {
        // urn:a sorts before urn:b even though prefix "y" sorts after "x".
        assert_eq!(
            c14n(r#"<e xmlns:x="urn:b" xmlns:y="urn:a" x:k="1" y:k="2" plain="3"/>"#),
            r#"<e xmlns:x="urn:b" xmlns:y="urn:a" plain="3" y:k="2" x:k="1"></e>"#
        );
    }

    #[test]
    fn test_default_namespace_undeclared_only_when_needed() {
        assert_eq!(
            c14n(r#"<a xmlns="urn:a"><b xmlns=""><c/></b></a>"#),
            r#"<a xmlns="urn:a"><b xmlns=""><c></c></b></a>"#
        );
        assert_eq!(c14n(r#"<a xmlns=""/>"#), "<a></a>");
    }

    #[test]
    fn test_escaping() {
        assert_eq!(
            c14n("<a v=\"&lt;&amp;&quot;&#x9;&#xA;\">&lt;&amp;&gt;\"'</a>"),
            "<a v=\"&lt;&amp;&quot;&#x9;&#xA;\">&lt;&amp;&gt;\"'</a>"
        );
    }

    #[test]
    fn test_subtree_uses_parent_scope() {
        let root =
            parse(r#"<r xmlns:s="urn:s" xmlns:other="urn:o"><s:Assertion ID="1"><s:N/></s:Assertion></r>"#)
                .unwrap();
        let path = vec![0];
        let scope = NamespaceScope::above(&root, &path);
        let subtree = root.element_at(&path).unwrap();

        assert_eq!(
            canonicalize(subtree, &scope, &[]),
            r#"<s:Assertion xmlns:s="urn:s" ID="1"><s:N></s:N></s:Assertion>"#
        );
    }

    #[test]
    fn test_inclusive_prefix_list_renders_in_scope_namespace() {
        let root = parse(r#"<r xmlns:xs="urn:xs"><a/></r>"#).unwrap();
        assert_eq!(
            canonicalize(&root, &NamespaceScope::new(), &["xs".to_string()]),
            r#"<r xmlns:xs="urn:xs"><a></a></r>"#
        );
    }

    #[test]
    fn test_whitespace_text_is_preserved() {
        assert_eq!(c14n("<a>\n  <b> x </b>\n</a>"), "<a>\n  <b> x </b>\n</a>");
    }
}
