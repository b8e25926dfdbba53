//! Extracting the authenticated user from a SAML response.
//!
//! Identity providers differ in which attribute carries the user and in how
//! they prefix namespaces, so lookups match on local names only and try the
//! SAML 2.0 and SAML 1.1 attribute layouts in a fixed order.

use base64::{Engine, engine::general_purpose::STANDARD};

use super::SsoError;
use crate::xml::{self, Element};

/// Attribute-name keys in lookup order: `(attribute, expected value)`.
///
/// SAML 2.0 names attributes with `Name`, SAML 1.1 with `AttributeName`.
const LOOKUP_ORDER: [(&str, &str); 4] = [
    ("Name", "userid"),
    ("AttributeName", "userid"),
    ("Name", "name"),
    ("AttributeName", "name"),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct SamlResponseExtractor;

impl SamlResponseExtractor {
    pub fn new() -> Self {
        Self
    }

    /// User ID from a base64-encoded SAML response as posted by the IdP.
    pub fn user_id_from_encoded(&self, encoded: &str) -> Result<String, SsoError> {
        let decoded = self.decode(encoded)?;
        self.user_id_from_decoded(&decoded)
    }

    /// User ID from an already-parsed assertion token.
    ///
    /// The token is serialized and goes through the same path as a decoded
    /// response, so both representations share one extraction algorithm.
    pub fn user_id_from_assertion(&self, assertion: &Element) -> Result<String, SsoError> {
        self.user_id_from_decoded(&assertion.to_xml_string())
    }

    /// User ID from a decoded SAML response document.
    pub fn user_id_from_decoded(&self, response: &str) -> Result<String, SsoError> {
        let document = self.parse(response)?;
        self.user_id_from_document(&document)
    }

    /// Parse a decoded response. Parse failures are `IdentityNotFound`.
    pub fn parse(&self, response: &str) -> Result<Element, SsoError> {
        xml::parse(response).map_err(|e| {
            tracing::warn!(error = %e, "Failed to parse SAML response");
            SsoError::identity_not_found_with("response is not well-formed XML", e)
        })
    }

    /// User ID from a parsed response, rejecting blank values.
    pub fn user_id_from_document(&self, document: &Element) -> Result<String, SsoError> {
        match self.extract_user_id(document) {
            Some(user_id) if !user_id.trim().is_empty() => Ok(user_id),
            _ => {
                tracing::warn!("userid attribute not found in SAML response");
                Err(SsoError::identity_not_found(
                    "the userid attribute was not found in the SAML response",
                ))
            }
        }
    }

    /// Base64 then UTF-8. ASCII whitespace (line wrapping) is ignored.
    pub fn decode(&self, encoded: &str) -> Result<String, SsoError> {
        let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let bytes = STANDARD.decode(compact).map_err(|e| {
            tracing::warn!(error = %e, "Failed to base64-decode SAML response");
            SsoError::identity_not_found_with("SAML response is not valid base64", e)
        })?;
        String::from_utf8(bytes).map_err(|e| {
            tracing::warn!(error = %e, "SAML response is not UTF-8");
            SsoError::identity_not_found_with("SAML response is not valid UTF-8", e)
        })
    }

    /// Text of the first matching `AttributeValue`, trying each layout in turn.
    ///
    /// A layout that matches stops the search even if its value is empty.
    pub fn extract_user_id(&self, document: &Element) -> Option<String> {
        LOOKUP_ORDER
            .iter()
            .find_map(|(key, value)| first_attribute_value(document, key, value))
    }

    /// `InResponseTo` of the response root, used to correlate with the
    /// request ID stored in the session.
    pub fn in_response_to<'a>(&self, document: &'a Element) -> Option<&'a str> {
        document.attribute("InResponseTo")
    }
}

/// `//Assertion//AttributeStatement//Attribute[@key='value']/AttributeValue`,
/// matched by local name, first hit in document order.
fn first_attribute_value(document: &Element, key: &str, value: &str) -> Option<String> {
    let mut assertions = Vec::new();
    if document.local_name == "Assertion" {
        assertions.push(document);
    }
    document.descendants_matching(&|e: &Element| e.local_name == "Assertion", &mut assertions);

    for assertion in assertions {
        let mut statements = Vec::new();
        assertion.descendants_matching(
            &|e: &Element| e.local_name == "AttributeStatement",
            &mut statements,
        );
        for statement in statements {
            let mut attributes = Vec::new();
            statement.descendants_matching(
                &|e: &Element| e.local_name == "Attribute" && e.attribute(key) == Some(value),
                &mut attributes,
            );
            if let Some(found) = attributes
                .iter()
                .find_map(|attribute| attribute.child("AttributeValue"))
            {
                return Some(found.text());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn saml2_response(attributes: &str) -> String {
        format!(
            r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r" InResponseTo="_req42">
  <saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a">
    <saml:AttributeStatement>{attributes}</saml:AttributeStatement>
  </saml:Assertion>
</samlp:Response>"#
        )
    }

    fn saml1_response(attributes: &str) -> String {
        format!(
            r#"<Response xmlns="urn:oasis:names:tc:SAML:1.0:protocol" ResponseID="_r">
  <Assertion xmlns="urn:oasis:names:tc:SAML:1.0:assertion" AssertionID="_a">
    <AttributeStatement>{attributes}</AttributeStatement>
  </Assertion>
</Response>"#
        )
    }

    fn encode(xml: &str) -> String {
        STANDARD.encode(xml)
    }

    #[rstest]
    #[case::saml2_userid(saml2_response(
        r#"<saml:Attribute Name="userid"><saml:AttributeValue>alice</saml:AttributeValue></saml:Attribute>"#
    ))]
    #[case::saml1_userid(saml1_response(
        r#"<Attribute AttributeName="userid"><AttributeValue>alice</AttributeValue></Attribute>"#
    ))]
    #[case::saml2_name(saml2_response(
        r#"<saml:Attribute Name="name"><saml:AttributeValue>alice</saml:AttributeValue></saml:Attribute>"#
    ))]
    #[case::saml1_name(saml1_response(
        r#"<Attribute AttributeName="name"><AttributeValue>alice</AttributeValue></Attribute>"#
    ))]
    fn test_extracts_user_id_from_each_layout(#[case] response: String) {
        let extractor = SamlResponseExtractor::new();
        assert_eq!(
            extractor.user_id_from_encoded(&encode(&response)).unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_userid_wins_over_name() {
        let response = saml2_response(
            r#"<saml:Attribute Name="name"><saml:AttributeValue>display</saml:AttributeValue></saml:Attribute>
               <saml:Attribute Name="userid"><saml:AttributeValue>alice</saml:AttributeValue></saml:Attribute>"#,
        );
        assert_eq!(
            SamlResponseExtractor::new()
                .user_id_from_decoded(&response)
                .unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_saml2_userid_wins_over_saml1_userid() {
        let response = saml1_response(
            r#"<Attribute AttributeName="userid"><AttributeValue>legacy</AttributeValue></Attribute>
               <Attribute Name="userid"><AttributeValue>current</AttributeValue></Attribute>"#,
        );
        assert_eq!(
            SamlResponseExtractor::new()
                .user_id_from_decoded(&response)
                .unwrap(),
            "current"
        );
    }

    #[test]
    fn test_empty_first_match_does_not_fall_back() {
        let response = saml2_response(
            r#"<saml:Attribute Name="userid"><saml:AttributeValue>  </saml:AttributeValue></saml:Attribute>
               <saml:Attribute Name="name"><saml:AttributeValue>alice</saml:AttributeValue></saml:Attribute>"#,
        );
        let err = SamlResponseExtractor::new()
            .user_id_from_decoded(&response)
            .unwrap_err();
        assert!(matches!(err, SsoError::IdentityNotFound { .. }));
    }

    #[test]
    fn test_attribute_outside_statement_is_ignored() {
        let response = r#"<Response><Assertion><Attribute Name="userid"><AttributeValue>alice</AttributeValue></Attribute></Assertion></Response>"#;
        assert!(
            SamlResponseExtractor::new()
                .user_id_from_decoded(response)
                .is_err()
        );
    }

    #[test]
    fn test_value_text_includes_nested_text() {
        let response = saml2_response(
            r#"<saml:Attribute Name="userid"><saml:AttributeValue>al<b>ic</b>e</saml:AttributeValue></saml:Attribute>"#,
        );
        assert_eq!(
            SamlResponseExtractor::new()
                .user_id_from_decoded(&response)
                .unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_no_attribute_is_identity_not_found() {
        let err = SamlResponseExtractor::new()
            .user_id_from_decoded(&saml2_response(""))
            .unwrap_err();
        assert!(matches!(err, SsoError::IdentityNotFound { source: None, .. }));
    }

    #[rstest]
    #[case::bad_base64("%%%not-base64%%%".to_string())]
    #[case::bad_utf8(STANDARD.encode([0xff, 0xfe, 0xfd]))]
    #[case::bad_xml(STANDARD.encode("<Response><unclosed></Response>"))]
    fn test_decode_failures_are_identity_not_found(#[case] encoded: String) {
        let err = SamlResponseExtractor::new()
            .user_id_from_encoded(&encoded)
            .unwrap_err();
        assert!(matches!(
            err,
            SsoError::IdentityNotFound {
                source: Some(_),
                ..
            }
        ));
    }

    #[test]
    fn test_encoded_response_tolerates_line_wrapping() {
        let response = saml2_response(
            r#"<saml:Attribute Name="userid"><saml:AttributeValue>alice</saml:AttributeValue></saml:Attribute>"#,
        );
        let wrapped = encode(&response)
            .as_bytes()
            .chunks(76)
            .map(|chunk| std::str::from_utf8(chunk).unwrap())
            .collect::<Vec<_>>()
            .join("\r\n");
        assert_eq!(
            SamlResponseExtractor::new()
                .user_id_from_encoded(&wrapped)
                .unwrap(),
            "alice"
        );
    }

    #[test]
    fn test_assertion_token_entry_point() {
        let document = xml::parse(&saml1_response(
            r#"<Attribute AttributeName="userid"><AttributeValue>bob</AttributeValue></Attribute>"#,
        ))
        .unwrap();
        let assertion = document.child("Assertion").unwrap();

        assert_eq!(
            SamlResponseExtractor::new()
                .user_id_from_assertion(assertion)
                .unwrap(),
            "bob"
        );
    }

    #[test]
    fn test_in_response_to() {
        let extractor = SamlResponseExtractor::new();
        let document = xml::parse(&saml2_response("")).unwrap();
        assert_eq!(extractor.in_response_to(&document), Some("_req42"));
    }
}
