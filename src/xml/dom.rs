use quick_xml::{Reader, escape::unescape, events::BytesStart, events::Event};

use super::{XML_NAMESPACE, XmlError};

/// A namespace declaration (`xmlns` or `xmlns:prefix`) as written on an element.
///
/// An empty `uri` on the default namespace is an undeclaration (`xmlns=""`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub prefix: Option<String>,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub prefix: Option<String>,
    pub local_name: String,
    pub value: String,
}

impl Attribute {
    pub fn qualified_name(&self) -> String {
        qualified(self.prefix.as_deref(), &self.local_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An owned XML element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub prefix: Option<String>,
    pub local_name: String,
    pub namespaces: Vec<Namespace>,
    pub attributes: Vec<Attribute>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(prefix: Option<&str>, local_name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.map(str::to_string),
            local_name: local_name.into(),
            namespaces: Vec::new(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn qualified_name(&self) -> String {
        qualified(self.prefix.as_deref(), &self.local_name)
    }

    /// Declare a namespace on this element, replacing an existing declaration
    /// for the same prefix.
    pub fn declare_namespace(&mut self, prefix: Option<&str>, uri: impl Into<String>) {
        let uri = uri.into();
        match self
            .namespaces
            .iter_mut()
            .find(|ns| ns.prefix.as_deref() == prefix)
        {
            Some(existing) => existing.uri = uri,
            None => self.namespaces.push(Namespace {
                prefix: prefix.map(str::to_string),
                uri,
            }),
        }
    }

    /// Look up an attribute by its qualified name as written (`ID`, `xml:lang`).
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| match &a.prefix {
                None => a.local_name == name,
                Some(prefix) => name
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix(':'))
                    .is_some_and(|local| local == a.local_name),
            })
            .map(|a| a.value.as_str())
    }

    /// Set an unprefixed attribute, replacing any previous value.
    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .attributes
            .iter_mut()
            .find(|a| a.prefix.is_none() && a.local_name == name)
        {
            Some(existing) => existing.value = value,
            None => self.attributes.push(Attribute {
                prefix: None,
                local_name: name.to_string(),
                value,
            }),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.push_text(&text.into());
        self
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Append text, merging with a preceding text node.
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(Node::Text(last)) = self.children.last_mut() {
            last.push_str(text);
        } else {
            self.children.push(Node::Text(text.to_string()));
        }
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First direct child element with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.local_name == local_name)
    }

    /// Node index of the first direct child element with the given local name.
    pub fn child_position(&self, local_name: &str) -> Option<usize> {
        self.children.iter().position(
            |node| matches!(node, Node::Element(element) if element.local_name == local_name),
        )
    }

    /// Concatenated text of all descendant text nodes.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => element.collect_text(out),
            }
        }
    }

    /// Depth-first, document-order search of this element and its descendants.
    ///
    /// Returns the node-index path from `self` to the first match; an empty
    /// path means `self` matched.
    pub fn find_path(&self, predicate: &impl Fn(&Element) -> bool) -> Option<Vec<usize>> {
        if predicate(self) {
            return Some(Vec::new());
        }
        for (index, node) in self.children.iter().enumerate() {
            if let Node::Element(child) = node
                && let Some(mut path) = child.find_path(predicate)
            {
                path.insert(0, index);
                return Some(path);
            }
        }
        None
    }

    /// All descendants (excluding `self`) matching the predicate, in document order.
    pub fn descendants_matching<'a>(
        &'a self,
        predicate: &impl Fn(&Element) -> bool,
        out: &mut Vec<&'a Element>,
    ) {
        for child in self.child_elements() {
            if predicate(child) {
                out.push(child);
            }
            child.descendants_matching(predicate, out);
        }
    }

    pub fn element_at(&self, path: &[usize]) -> Option<&Element> {
        let mut current = self;
        for &index in path {
            current = match current.children.get(index)? {
                Node::Element(element) => element,
                Node::Text(_) => return None,
            };
        }
        Some(current)
    }

    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut Element> {
        let mut current = self;
        for &index in path {
            current = match current.children.get_mut(index)? {
                Node::Element(element) => element,
                Node::Text(_) => return None,
            };
        }
        Some(current)
    }

    /// Serialize for transport. Empty elements use the self-closing form.
    pub fn to_xml_string(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut String) {
        let name = self.qualified_name();
        out.push('<');
        out.push_str(&name);
        for ns in &self.namespaces {
            match &ns.prefix {
                Some(prefix) => {
                    out.push_str(" xmlns:");
                    out.push_str(prefix);
                }
                None => out.push_str(" xmlns"),
            }
            out.push_str("=\"");
            escape_attribute_into(&ns.uri, out);
            out.push('"');
        }
        for attr in &self.attributes {
            out.push(' ');
            out.push_str(&attr.qualified_name());
            out.push_str("=\"");
            escape_attribute_into(&attr.value, out);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Text(text) => escape_text_into(text, out),
                Node::Element(element) => element.write_to(out),
            }
        }
        out.push_str("</");
        out.push_str(&name);
        out.push('>');
    }
}

/// Prefix bindings in scope at some point of a document.
#[derive(Debug, Clone, Default)]
pub struct NamespaceScope {
    bindings: Vec<Namespace>,
}

impl NamespaceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope inside `element`: the current bindings plus its own declarations.
    pub fn enter(&self, element: &Element) -> Self {
        let mut bindings = self.bindings.clone();
        bindings.extend(element.namespaces.iter().cloned());
        Self { bindings }
    }

    /// Scope of the parent of the element at `path` below `root`.
    pub fn above(root: &Element, path: &[usize]) -> Self {
        let mut scope = Self::new();
        let mut current = root;
        for &index in path {
            scope = scope.enter(current);
            match current.children.get(index) {
                Some(Node::Element(element)) => current = element,
                _ => break,
            }
        }
        scope
    }

    /// Namespace URI bound to `prefix` (`None` = default namespace).
    ///
    /// Returns `None` when the prefix is unbound or bound to the empty string.
    pub fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        if prefix == Some("xml") {
            return Some(XML_NAMESPACE);
        }
        self.bindings
            .iter()
            .rev()
            .find(|ns| ns.prefix.as_deref() == prefix)
            .map(|ns| ns.uri.as_str())
            .filter(|uri| !uri.is_empty())
    }

    /// Namespace URI of `element`; the scope must already include it.
    pub fn element_namespace(&self, element: &Element) -> Option<&str> {
        self.resolve(element.prefix.as_deref())
    }
}

/// Parse a complete XML document into its root element.
///
/// Comments and processing instructions are dropped, CDATA sections become
/// text and document type declarations are rejected.
pub fn parse(input: &str) -> Result<Element, XmlError> {
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");
    let mut reader = Reader::from_str(&normalized);

    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        match reader.read_event()? {
            Event::Start(start) => {
                if root.is_some() {
                    return Err(XmlError::ContentOutsideRoot);
                }
                stack.push(element_from_start(&start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err(XmlError::ContentOutsideRoot);
                }
                let element = element_from_start(&start)?;
                close_element(&mut stack, &mut root, element);
            }
            Event::End(_) => {
                if let Some(element) = stack.pop() {
                    close_element(&mut stack, &mut root, element);
                }
            }
            Event::Text(text) => match stack.last_mut() {
                Some(parent) => parent.push_text(&text.unescape()?),
                None if text.iter().all(u8::is_ascii_whitespace) => {}
                None => return Err(XmlError::ContentOutsideRoot),
            },
            Event::CData(data) => match stack.last_mut() {
                Some(parent) => parent.push_text(std::str::from_utf8(&data)?),
                None => return Err(XmlError::ContentOutsideRoot),
            },
            Event::DocType(_) => return Err(XmlError::DoctypeNotAllowed),
            Event::Comment(_) | Event::PI(_) | Event::Decl(_) => {}
            Event::Eof => break,
        }
    }

    if let Some(open) = stack.last() {
        return Err(XmlError::UnclosedElement(open.qualified_name()));
    }
    root.ok_or(XmlError::MissingRoot)
}

fn close_element(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.push_child(element),
        None => *root = Some(element),
    }
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let qname = start.name();
    let name = std::str::from_utf8(qname.as_ref())?;
    let (prefix, local_name) = split_qname(name);
    let mut element = Element::new(prefix, local_name);

    for attr in start.attributes() {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())?;
        let raw = std::str::from_utf8(&attr.value)?;
        // Literal whitespace in attribute values normalizes to spaces; character
        // references survive because unescaping happens afterwards.
        let normalized: String = raw
            .chars()
            .map(|c| if matches!(c, '\t' | '\n' | '\r') { ' ' } else { c })
            .collect();
        let value = unescape(&normalized)?.into_owned();

        if key == "xmlns" {
            element.namespaces.push(Namespace { prefix: None, uri: value });
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            element.namespaces.push(Namespace {
                prefix: Some(prefix.to_string()),
                uri: value,
            });
        } else {
            let (prefix, local_name) = split_qname(key);
            element.attributes.push(Attribute {
                prefix: prefix.map(str::to_string),
                local_name: local_name.to_string(),
                value,
            });
        }
    }

    Ok(element)
}

fn split_qname(name: &str) -> (Option<&str>, &str) {
    match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix), local),
        None => (None, name),
    }
}

fn qualified(prefix: Option<&str>, local_name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}:{local_name}"),
        None => local_name.to_string(),
    }
}

fn escape_text_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn escape_attribute_into(value: &str, out: &mut String) {
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

    #[test]
    fn test_parse_keeps_namespaces_and_attributes() {
        let root = parse(
            r#"<?xml version="1.0"?>
<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_abc" Version="2.0">
  <saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">idp</saml:Issuer>
</samlp:Response>"#,
        )
        .unwrap();

        assert_eq!(root.prefix.as_deref(), Some("samlp"));
        assert_eq!(root.local_name, "Response");
        assert_eq!(root.attribute("ID"), Some("_abc"));
        assert_eq!(root.namespaces.len(), 1);

        let issuer = root.child("Issuer").unwrap();
        assert_eq!(issuer.text(), "idp");

        let scope = NamespaceScope::new().enter(&root).enter(issuer);
        assert_eq!(
            scope.element_namespace(issuer),
            Some("urn:oasis:names:tc:SAML:2.0:assertion")
        );
    }

    #[test]
    fn test_parse_unescapes_text_and_attributes() {
        let root = parse(r#"<a b="x &amp; &quot;y&quot;">1 &lt; 2<![CDATA[ & 3]]></a>"#).unwrap();
        assert_eq!(root.attribute("b"), Some("x & \"y\""));
        assert_eq!(root.text(), "1 < 2 & 3");
        assert_eq!(root.children.len(), 1);
    }

    #[test]
    fn test_parse_normalizes_attribute_whitespace() {
        let root = parse("<a b=\"one\ttwo&#xA;three\"/>").unwrap();
        assert_eq!(root.attribute("b"), Some("one two\nthree"));
    }

    #[test]
    fn test_parse_drops_comments() {
        let root = parse("<a><!-- hidden -->text<?pi x?></a>").unwrap();
        assert_eq!(root.children, vec![Node::Text("text".into())]);
    }

    #[test]
    fn test_parse_rejects_doctype() {
        let err = parse("<!DOCTYPE a [<!ENTITY x \"y\">]><a>&x;</a>").unwrap_err();
        assert!(matches!(err, XmlError::DoctypeNotAllowed));
    }

    #[test]
    fn test_parse_rejects_second_root() {
        let err = parse("<a/><b/>").unwrap_err();
        assert!(matches!(err, XmlError::ContentOutsideRoot));
    }

    #[test]
    fn test_parse_rejects_unclosed_element() {
        assert!(parse("<a><b></b>").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_input() {
        assert!(matches!(parse("   ").unwrap_err(), XmlError::MissingRoot));
    }

    #[test]
    fn test_serialize_round_trips_through_parser() {
        let mut root = Element::new(Some("p"), "Root");
        root.declare_namespace(Some("p"), "urn:p");
        root.set_attribute("ID", "_1");
        root.push_child(Element::new(None, "Empty"));
        root.push_child(Element::new(None, "Text").with_text("a<b & \"c\""));

        let xml = root.to_xml_string();
        assert_eq!(
            xml,
            r#"<p:Root xmlns:p="urn:p" ID="_1"><Empty/><Text>a&lt;b &amp; "c"</Text></p:Root>"#
        );
        assert_eq!(parse(&xml).unwrap(), root);
    }

    #[test]
    fn test_find_path_and_scope_above() {
        let root = parse(
            r#"<r xmlns="urn:default" xmlns:x="urn:x"><x:a><x:b ID="target"/></x:a></r>"#,
        )
        .unwrap();

        let path = root.find_path(&|e: &Element| e.attribute("ID") == Some("target")).unwrap();
        assert_eq!(path, vec![0, 0]);
        assert_eq!(root.element_at(&path).unwrap().local_name, "b");

        let scope = NamespaceScope::above(&root, &path);
        assert_eq!(scope.resolve(Some("x")), Some("urn:x"));
        assert_eq!(scope.resolve(None), Some("urn:default"));
        assert_eq!(scope.resolve(Some("missing")), None);
    }

    #[test]
    fn test_default_namespace_undeclaration_resolves_to_none() {
        let root = parse(r#"<a xmlns="urn:a"><b xmlns=""/></a>"#).unwrap();
        let b = root.child("b").unwrap();
        let scope = NamespaceScope::new().enter(&root).enter(b);
        assert_eq!(scope.element_namespace(b), None);
    }
}
