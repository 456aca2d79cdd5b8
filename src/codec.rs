//! Bidirectional mapping between DNS names and directory DN components.
//!
//! The escape path mangles network input that ends up inside DNs, so the
//! rules are strict: anything outside `[A-Za-z0-9._-]` becomes `\HH`, and
//! malformed escapes abort the whole conversion instead of degrading.

use bytes::Bytes;
use domain::base::name::{Name, ToLabelIter};

use crate::error::Result;

pub type DnsName = Name<Bytes>;

/// Attribute carrying DNS names inside DNs.
pub const ATTR_IDNS_NAME: &str = "idnsName";

/// Bytes copied verbatim by the DN escape form.
fn is_dn_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')
}

/// Bytes copied (lowercased) by the filesafe escape form.
fn is_file_safe(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-')
}

/// Renders an absolute name with its trailing dot, `"."` for the root.
pub fn name_text(name: &DnsName) -> String {
    if name.is_root() {
        ".".to_string()
    } else {
        format!("{}.", name)
    }
}

/// True when `child` is equal to or below `parent`.
pub fn contains(parent: &DnsName, child: &DnsName) -> bool {
    let depth = parent.label_count();
    if child.label_count() < depth {
        return false;
    }
    let mut walk = child.clone();
    while walk.label_count() > depth {
        match walk.parent() {
            Some(up) => walk = up,
            None => return false,
        }
    }
    walk == *parent
}

/// Decodes master-file text into raw bytes, resolving `\DDD` and `\X`
/// escapes. Any malformed escape is fatal.
pub fn master_decode(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(d @ b'0'..=b'9') => {
                let (d2, d3) = match (bytes.next(), bytes.next()) {
                    (Some(d2 @ b'0'..=b'9'), Some(d3 @ b'0'..=b'9')) => (d2, d3),
                    _ => {
                        return Err(
                            error!(BadEscape => "truncated decimal escape in '{}'", text),
                        )
                    }
                };
                let value = (d - b'0') as u16 * 100 + (d2 - b'0') as u16 * 10 + (d3 - b'0') as u16;
                if value > 255 {
                    return Err(error!(BadEscape => "decimal escape out of range in '{}'", text));
                }
                out.push(value as u8);
            }
            Some(c) => out.push(c),
            None => return Err(error!(BadEscape => "trailing backslash in '{}'", text)),
        }
    }

    Ok(out)
}

/// Renders raw bytes as master-file text; everything that could be taken
/// for zone-file syntax is emitted as `\DDD`.
pub fn master_encode(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if b.is_ascii_graphic() && !matches!(b, b'\\' | b'"' | b'(' | b')' | b';') {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:03}", b));
        }
    }
    out
}

/// Escapes raw bytes into the directory `\HH` form.
pub fn escape_bytes(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if is_dn_safe(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{:02X}", b));
        }
    }
    out
}

/// Reverses [`escape_bytes`]. Also accepts the single-character escapes
/// (`\,`, `\+`, ...) other DN producers emit.
pub fn unescape_bytes(escaped: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.bytes();

    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(h1) if h1.is_ascii_hexdigit() => match bytes.next() {
                Some(h2) if h2.is_ascii_hexdigit() => {
                    let hex = [h1, h2];
                    let hex = std::str::from_utf8(&hex).expect("hex digits are ascii");
                    out.push(u8::from_str_radix(hex, 16).expect("checked hex digits"));
                }
                _ => {
                    return Err(error!(BadEscape => "truncated hex escape in '{}'", escaped));
                }
            },
            Some(c @ (b' ' | b'"' | b'#' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\')) => {
                out.push(c)
            }
            Some(c) => {
                return Err(error!(BadEscape => "invalid escape '\\{}' in '{}'", c as char, escaped));
            }
            None => return Err(error!(BadEscape => "trailing backslash in '{}'", escaped)),
        }
    }

    Ok(out)
}

/// Converts master-file text into a DN attribute value.
pub fn dn_escape(master_text: &str) -> Result<String> {
    let raw = master_decode(master_text)?;
    Ok(escape_bytes(&raw))
}

/// Converts a DN attribute value back into master-file text.
pub fn dn_unescape(value: &str) -> Result<String> {
    let raw = unescape_bytes(value)?;
    Ok(master_encode(&raw))
}

/// The filesafe rendering used for per-zone directories: non
/// `[0-9A-Za-z._-]` bytes become `%HH`, letters are lowercased, the
/// trailing dot is dropped and the root zone maps to `@`.
pub fn filesafe_name(name: &DnsName) -> Result<String> {
    if name.is_root() {
        return Ok("@".to_string());
    }

    let raw = master_decode(&name.to_string())?;
    let mut out = String::with_capacity(raw.len());
    for &b in &raw {
        if is_file_safe(b) {
            out.push(b.to_ascii_lowercase() as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    Ok(out)
}

/// What a DN points at once its `idnsName` components are interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnTarget {
    /// No `idnsName` component: the instance configuration entry.
    Config,
    /// One component: a zone, named by its origin.
    Zone { origin: DnsName },
    /// Two components: a record owner inside a zone.
    Record { owner: DnsName, origin: DnsName },
}

impl DnTarget {
    /// The most specific name the target carries, if any.
    pub fn name(&self) -> Option<&DnsName> {
        match self {
            DnTarget::Config => None,
            DnTarget::Zone { origin } => Some(origin),
            DnTarget::Record { owner, .. } => Some(owner),
        }
    }
}

/// Splits a DN into `(attribute, value)` components, rejecting
/// multi-valued RDNs.
fn split_dn(dn: &str) -> Result<Vec<(String, String)>> {
    let mut components = Vec::new();
    let mut attr = String::new();
    let mut value = String::new();
    let mut in_value = false;
    let mut escaped = false;

    for c in dn.chars() {
        if escaped {
            if in_value {
                value.push('\\');
                value.push(c);
            } else {
                attr.push('\\');
                attr.push(c);
            }
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' if !in_value => in_value = true,
            '+' => {
                return Err(
                    error!(NotImplemented => "multi-valued RDN in '{}' is not supported", dn),
                );
            }
            ',' => {
                if !in_value {
                    return Err(error!(BadOwnerName => "component without value in '{}'", dn));
                }
                components.push((attr.trim().to_string(), value.clone()));
                attr.clear();
                value.clear();
                in_value = false;
            }
            _ => {
                if in_value {
                    value.push(c);
                } else {
                    attr.push(c);
                }
            }
        }
    }
    if escaped {
        return Err(error!(BadEscape => "trailing backslash in '{}'", dn));
    }
    if in_value {
        components.push((attr.trim().to_string(), value));
    } else if !attr.trim().is_empty() {
        return Err(error!(BadOwnerName => "component without value in '{}'", dn));
    }

    Ok(components)
}

fn component_name(value: &str) -> Result<DnsName> {
    let text = dn_unescape(value.trim())?;
    if text.is_empty() {
        return Err(error!(BadOwnerName => "empty idnsName value"));
    }
    DnsName::bytes_from_str(&text)
        .map_err(|e| error!(DomainStr => "'{}' is not a valid DNS name: {}", text, e))
}

/// Interprets the leading `idnsName` components of a DN.
///
/// One component names a zone apex; two name a record owner that must be a
/// proper subdomain of its zone. A two-component DN whose owner equals the
/// apex is rejected, the apex is only ever written in the one-component
/// form.
pub fn dn_to_name(dn: &str) -> Result<DnTarget> {
    let components = split_dn(dn)?;

    let mut names = Vec::new();
    for (attr, value) in &components {
        if attr.eq_ignore_ascii_case(ATTR_IDNS_NAME) {
            if names.len() == 2 {
                return Err(error!(BadOwnerName => "more than two idnsName components in '{}'", dn));
            }
            names.push(value.as_str());
        } else {
            break;
        }
    }

    match names.as_slice() {
        [] => Ok(DnTarget::Config),
        [origin] => Ok(DnTarget::Zone {
            origin: component_name(origin)?,
        }),
        [owner, origin] => {
            let origin = component_name(origin)?;
            let owner_text = dn_unescape(owner.trim())?;
            if owner_text.is_empty() {
                return Err(error!(BadOwnerName => "empty owner in '{}'", dn));
            }
            let owner = if owner_text.ends_with('.') {
                DnsName::bytes_from_str(&owner_text)?
            } else if origin.is_root() {
                DnsName::bytes_from_str(&format!("{}.", owner_text))?
            } else {
                DnsName::bytes_from_str(&format!("{}.{}", owner_text, name_text(&origin)))?
            };
            if owner == origin {
                return Err(
                    error!(BadOwnerName => "owner '{}' equals its zone apex in '{}'", owner_text, dn),
                );
            }
            if !contains(&origin, &owner) {
                return Err(
                    error!(BadOwnerName => "owner '{}' is outside zone '{}'", owner_text, origin),
                );
            }
            Ok(DnTarget::Record { owner, origin })
        }
        _ => unreachable!("capped at two components"),
    }
}

/// Builds the DN for `name` below a zone rooted at `origin` whose entry
/// lives at `zone_dn`. The apex maps to the zone DN itself.
pub fn name_to_dn(name: &DnsName, origin: &DnsName, zone_dn: &str) -> Result<String> {
    if name == origin {
        return Ok(zone_dn.to_string());
    }
    if !contains(origin, name) {
        return Err(
            error!(BadOwnerName => "'{}' is not inside zone '{}'", name_text(name), name_text(origin)),
        );
    }

    let above = name.label_count() - origin.label_count();
    let relative = name
        .iter_labels()
        .take(above)
        .map(|label| label.to_string())
        .collect::<Vec<_>>()
        .join(".");

    Ok(format!(
        "{}={},{}",
        ATTR_IDNS_NAME,
        dn_escape(&relative)?,
        zone_dn
    ))
}

/// Canonical form used when comparing DNs: case-folded, separator
/// whitespace dropped.
pub fn dn_canonical(dn: &str) -> String {
    dn.split(',')
        .map(|part| part.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(text: &str) -> DnsName {
        DnsName::bytes_from_str(text).unwrap()
    }

    #[test]
    fn escape_safe_bytes_verbatim() {
        assert_eq!(escape_bytes(b"example.org"), "example.org");
        assert_eq!(escape_bytes(b"host_a-b.c"), "host_a-b.c");
    }

    #[test]
    fn escape_unsafe_bytes_as_hex() {
        assert_eq!(escape_bytes(b"a b"), "a\\20b");
        assert_eq!(escape_bytes(b"a,b+c"), "a\\2Cb\\2Bc");
        assert_eq!(escape_bytes(&[0x00, 0xFF]), "\\00\\FF");
    }

    #[test]
    fn escape_reversibility() {
        let cases: &[&[u8]] = &[
            b"plain",
            b"with space",
            b"comma,plus+equals=",
            &[0x00, 0x01, 0x7F, 0x80, 0xFF],
            b"\\already\\escaped",
        ];
        for raw in cases {
            let escaped = escape_bytes(raw);
            assert!(
                escaped
                    .bytes()
                    .all(|b| is_dn_safe(b) || b == b'\\' || b.is_ascii_hexdigit()),
                "unexpected byte in '{}'",
                escaped
            );
            assert_eq!(unescape_bytes(&escaped).unwrap(), *raw);
        }
    }

    #[test]
    fn master_escape_round_trip() {
        assert_eq!(master_decode("plain").unwrap(), b"plain");
        assert_eq!(master_decode("a\\046b").unwrap(), b"a.b");
        assert_eq!(master_decode("a\\.b").unwrap(), b"a.b");
        assert_eq!(master_decode(&master_encode(b"a b\xFFc")).unwrap(), b"a b\xFFc");
    }

    #[test]
    fn malformed_master_escapes_are_fatal() {
        assert!(master_decode("a\\").is_err());
        assert!(master_decode("a\\04").is_err());
        assert!(master_decode("a\\999").is_err());
    }

    #[test]
    fn malformed_dn_escapes_are_fatal() {
        assert!(unescape_bytes("a\\2").is_err());
        assert!(unescape_bytes("a\\2G").is_err());
        assert!(unescape_bytes("a\\x41").is_err());
        assert!(unescape_bytes("a\\").is_err());
    }

    #[test]
    fn config_dn() {
        let target = dn_to_name("cn=dns, dc=example,dc=test").unwrap();
        assert_eq!(target, DnTarget::Config);
    }

    #[test]
    fn zone_dn() {
        let target = dn_to_name("idnsName=example.org., cn=dns, dc=example,dc=test").unwrap();
        assert_eq!(
            target,
            DnTarget::Zone {
                origin: name("example.org.")
            }
        );
    }

    #[test]
    fn record_dn_with_relative_owner() {
        let target =
            dn_to_name("idnsName=host, idnsName=example.org., cn=dns, dc=example,dc=test").unwrap();
        assert_eq!(
            target,
            DnTarget::Record {
                owner: name("host.example.org."),
                origin: name("example.org."),
            }
        );
    }

    #[test]
    fn record_dn_with_multi_label_owner() {
        let target =
            dn_to_name("idnsName=a.b, idnsName=example.org., cn=dns, dc=example,dc=test").unwrap();
        assert_eq!(
            target,
            DnTarget::Record {
                owner: name("a.b.example.org."),
                origin: name("example.org."),
            }
        );
    }

    #[test]
    fn owner_equal_to_apex_is_rejected() {
        let err = dn_to_name("idnsName=example.org., idnsName=example.org., cn=dns, dc=test")
            .unwrap_err();
        assert!(err.is(crate::error::ErrorKind::BadOwnerName));
    }

    #[test]
    fn owner_outside_zone_is_rejected() {
        let err =
            dn_to_name("idnsName=host.other.test., idnsName=example.org., cn=dns, dc=test")
                .unwrap_err();
        assert!(err.is(crate::error::ErrorKind::BadOwnerName));
    }

    #[test]
    fn multi_valued_rdn_is_rejected() {
        let err = dn_to_name("idnsName=a+sn=b, idnsName=example.org., cn=dns, dc=test").unwrap_err();
        assert!(err.is(crate::error::ErrorKind::NotImplemented));
    }

    #[test]
    fn three_idns_components_are_rejected() {
        let err = dn_to_name("idnsName=a, idnsName=b, idnsName=example.org., cn=dns").unwrap_err();
        assert!(err.is(crate::error::ErrorKind::BadOwnerName));
    }

    #[test]
    fn name_to_dn_apex_is_zone_dn() {
        let dn = name_to_dn(
            &name("example.org."),
            &name("example.org."),
            "idnsName=example.org.,cn=dns,dc=test",
        )
        .unwrap();
        assert_eq!(dn, "idnsName=example.org.,cn=dns,dc=test");
    }

    #[test]
    fn name_to_dn_strips_origin_labels() {
        let dn = name_to_dn(
            &name("a.b.example.org."),
            &name("example.org."),
            "idnsName=example.org.,cn=dns,dc=test",
        )
        .unwrap();
        assert_eq!(dn, "idnsName=a.b,idnsName=example.org.,cn=dns,dc=test");
    }

    #[test]
    fn name_round_trip_through_dn() {
        let zone_dn = "idnsName=example.org.,cn=dns,dc=test";
        let owner = name("Host-1.example.org.");
        let dn = name_to_dn(&owner, &name("example.org."), zone_dn).unwrap();
        match dn_to_name(&dn).unwrap() {
            DnTarget::Record {
                owner: parsed,
                origin,
            } => {
                assert_eq!(parsed, owner);
                assert_eq!(origin, name("example.org."));
            }
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn filesafe_names() {
        assert_eq!(filesafe_name(&name(".")).unwrap(), "@");
        assert_eq!(
            filesafe_name(&name("Example.ORG.")).unwrap(),
            "example.org"
        );
        assert_eq!(
            filesafe_name(&name("sub.example.org.")).unwrap(),
            "sub.example.org"
        );
    }

    #[test]
    fn dn_canonical_folds_case_and_spaces() {
        assert_eq!(
            dn_canonical("CN=dns, DC=Example,DC=Test"),
            dn_canonical("cn=dns,dc=example,dc=test")
        );
    }

    #[test]
    fn containment() {
        assert!(contains(&name("example.org."), &name("a.example.org.")));
        assert!(contains(&name("example.org."), &name("example.org.")));
        assert!(contains(&name("."), &name("example.org.")));
        assert!(!contains(&name("example.org."), &name("example.com.")));
        assert!(!contains(&name("a.example.org."), &name("example.org.")));
    }
}
