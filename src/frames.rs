//! EPP frame document construction.
//!
//! Builds the three documents this proxy originates itself: `hello`,
//! `login` and `logout`. Everything else on the wire is relayed opaquely.

use crate::xml::XmlBuilder;
use uuid::Uuid;

/// The EPP 1.0 namespace; the single root element of every frame.
pub const EPP_NS: &str = "urn:ietf:params:xml:ns:epp-1.0";

/// Credentials and service lists for a `<login>` command.
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub object_uris: &'a [String],
    pub extension_uris: &'a [String],
    pub lang: &'a str,
}

/// Generate a process-unique client transaction identifier.
pub fn new_trid() -> String {
    format!("epprelay-{}", Uuid::new_v4())
}

/// The fixed `<hello/>` frame used to solicit a fresh greeting.
pub fn hello() -> String {
    let mut xml = XmlBuilder::new();
    xml.element("epp", &[("xmlns", EPP_NS)], |xml| xml.empty("hello"));
    xml.into_string()
}

/// Construct a `<login>` command frame. A fresh clTRID is generated when
/// `trid` is not supplied.
pub fn login(request: &LoginRequest<'_>, trid: Option<&str>) -> String {
    let trid = trid.map_or_else(new_trid, str::to_owned);
    let mut xml = XmlBuilder::new();
    xml.element("epp", &[("xmlns", EPP_NS)], |xml| {
        xml.element("command", &[], |xml| {
            xml.element("login", &[], |xml| {
                xml.leaf("clID", request.username);
                xml.leaf("pw", request.password);
                xml.element("options", &[], |xml| {
                    xml.leaf("version", "1.0");
                    xml.leaf("lang", request.lang);
                });
                xml.element("svcs", &[], |xml| {
                    for uri in request.object_uris {
                        xml.leaf("objURI", uri);
                    }
                    xml.element("svcExtension", &[], |xml| {
                        for uri in request.extension_uris {
                            xml.leaf("extURI", uri);
                        }
                    });
                });
            });
            xml.leaf("clTRID", &trid);
        });
    });
    xml.into_string()
}

/// Construct a `<logout>` command frame.
pub fn logout(trid: Option<&str>) -> String {
    let trid = trid.map_or_else(new_trid, str::to_owned);
    let mut xml = XmlBuilder::new();
    xml.element("epp", &[("xmlns", EPP_NS)], |xml| {
        xml.element("command", &[], |xml| {
            xml.empty("logout");
            xml.leaf("clTRID", &trid);
        });
    });
    xml.into_string()
}
