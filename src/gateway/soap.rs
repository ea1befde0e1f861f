//! Minimal SOAP envelope handling for the gateway's non-JSON modality
//! (spec.md §4.7: "the RPC is taken from the XML `Body` first-child
//! element name via the impl table").

use crate::error::IcError;
use crate::iop_xml::reader::{self, XmlCursor};

fn local_name(tag: &str) -> &str {
    tag.rsplit(':').next().unwrap_or(tag)
}

fn render_start_tag(name: &str, attrs: &[(String, String)]) -> String {
    let mut tag = format!("<{name}");
    for (k, v) in attrs {
        tag.push_str(&format!(" {k}=\"{}\"", xml_escape(v)));
    }
    tag.push('>');
    tag
}

/// Finds the SOAP `Body`'s first child element and reconstructs it as
/// a standalone XML fragment (own start tag with its attributes, its
/// inner XML, its own end tag) so it can be fed straight into
/// [`crate::iop_xml::unpack`] as if it were its own document. Returns
/// the element's (possibly namespace-prefixed) local name alongside
/// the fragment.
pub fn extract_soap_rpc(body: &[u8]) -> Result<(String, Vec<u8>), IcError> {
    let doc = reader::parse(body)?;
    let mut cursor = XmlCursor::at_root(&doc);
    if local_name(cursor.node_open()) != "Envelope" {
        return Err(IcError::invalid("SOAP request is missing an Envelope root"));
    }
    if !cursor.next_child() {
        return Err(IcError::invalid("SOAP Envelope has no children"));
    }
    loop {
        if local_name(cursor.node_open()) == "Body" {
            break;
        }
        if !cursor.next_sibling() {
            return Err(IcError::invalid("SOAP Envelope has no Body element"));
        }
    }
    if !cursor.next_child() {
        return Err(IcError::invalid("SOAP Body is empty"));
    }
    let name = local_name(cursor.node_open()).to_string();
    let mut fragment = render_start_tag(&name, cursor.attrs());
    fragment.push_str(cursor.inner_xml());
    fragment.push_str(&format!("</{name}>"));
    Ok((name, fragment.into_bytes()))
}

/// Wraps a packed IOP XML response body in a minimal SOAP envelope.
pub fn wrap_soap_response(rpc_name: &str, body_xml: &[u8]) -> Vec<u8> {
    let mut out = String::from(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body>"#,
    );
    out.push_str(&format!("<{rpc_name}Response>"));
    out.push_str(&String::from_utf8_lossy(body_xml));
    out.push_str(&format!("</{rpc_name}Response>"));
    out.push_str("</soap:Body></soap:Envelope>");
    out.into_bytes()
}

/// Builds a SOAP Fault body (spec.md §4.7: "SOAP errors return a SOAP
/// Fault with HTTP 500").
pub fn soap_fault(faultstring: &str) -> Vec<u8> {
    format!(
        r#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"><soap:Body><soap:Fault><faultcode>soap:Server</faultcode><faultstring>{}</faultstring></soap:Fault></soap:Body></soap:Envelope>"#,
        xml_escape(faultstring)
    )
    .into_bytes()
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_rpc_name_from_body_first_child() {
        let envelope = br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
            <soap:Body><doThing n="3"><n>3</n></doThing></soap:Body>
        </soap:Envelope>"#;
        let (name, fragment) = extract_soap_rpc(envelope).unwrap();
        assert_eq!(name, "doThing");
        assert!(String::from_utf8_lossy(&fragment).starts_with("<doThing"));
        assert!(String::from_utf8_lossy(&fragment).contains("<n>3</n>"));
    }

    #[test]
    fn missing_body_is_rejected() {
        let envelope = br#"<soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/"></soap:Envelope>"#;
        assert!(extract_soap_rpc(envelope).is_err());
    }
}
