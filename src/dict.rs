// dict.rs - RADIUS attribute dictionary
//
// The dictionary is loaded once at startup from a line-oriented text file and
// is read-only afterwards. Attribute and value records keep their file order;
// lookups are linear scans, which is fine for the few hundred entries a
// RADIUS dictionary holds.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Semantic type of a dictionary attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    Integer,
    String,
    Date,
    IpAddr,
}

impl AttrType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "integer" => Some(Self::Integer),
            "string" => Some(Self::String),
            "date" => Some(Self::Date),
            "ipaddr" => Some(Self::IpAddr),
            _ => None,
        }
    }

    /// Keyword as it appears in dictionary files
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::String => "string",
            Self::Date => "date",
            Self::IpAddr => "ipaddr",
        }
    }
}

/// Decoded literal of a VALUE entry
#[derive(Debug, Clone, PartialEq)]
pub enum ValueData {
    Integer(i32),
    String(String),
    Date(u32),
    IpAddr(Ipv4Addr),
}

/// A named value belonging to an attribute
#[derive(Debug, Clone)]
pub struct DictValue {
    pub name: String,
    pub data: ValueData,
}

/// A dictionary attribute record
#[derive(Debug, Clone)]
pub struct DictAttr {
    pub name: String,
    pub id: u8,
    pub typ: AttrType,
    pub values: Vec<DictValue>,
}

impl DictAttr {
    /// Find a named value of this attribute
    pub fn find_value(&self, name: &str) -> Option<&DictValue> {
        self.values.iter().find(|v| v.name == name)
    }

    /// Find the value entry matching an encoded integer.
    ///
    /// Only meaningful for integer-typed attributes; other types return None.
    pub fn find_value_by_integer(&self, n: i32) -> Option<&DictValue> {
        if self.typ != AttrType::Integer {
            return None;
        }
        self.values
            .iter()
            .find(|v| v.data == ValueData::Integer(n))
    }
}

/// The attribute dictionary
#[derive(Debug, Default)]
pub struct Dictionary {
    attrs: Vec<Arc<DictAttr>>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a dictionary file, replacing nothing on failure.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fname = path.as_ref().display().to_string();
        let src = fs::read_to_string(path.as_ref())?;
        let mut dict = Self::new();
        dict.load_str(&src, &fname)?;
        Ok(dict)
    }

    /// Parse dictionary text into this dictionary.
    ///
    /// The parse is transactional: on any error the dictionary is left as it
    /// was and the partial parse is discarded. `fname` only labels
    /// diagnostics.
    pub fn load_str(&mut self, src: &str, fname: &str) -> Result<()> {
        let mut work = self.attrs.clone();

        for (idx, raw) in src.lines().enumerate() {
            let n = idx + 1;
            // Tolerate DOS line endings; split() below only knows tab/space.
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() != 4 {
                return Err(syntax(fname, n, "expected keyword and three fields"));
            }

            match tokens[0] {
                "ATTRIBUTE" => {
                    let name = tokens[1];
                    let id: u8 = tokens[2]
                        .parse()
                        .map_err(|_| syntax(fname, n, "attribute id must be 1..255"))?;
                    if id == 0 {
                        return Err(syntax(fname, n, "attribute id must be 1..255"));
                    }
                    let typ = AttrType::parse(tokens[3])
                        .ok_or_else(|| syntax(fname, n, "unknown attribute type"))?;
                    if work.iter().any(|a| a.name == name || a.id == id) {
                        return Err(syntax(fname, n, "duplicate attribute"));
                    }
                    work.push(Arc::new(DictAttr {
                        name: name.to_string(),
                        id,
                        typ,
                        values: Vec::new(),
                    }));
                }
                "VALUE" => {
                    let attr = work
                        .iter_mut()
                        .find(|a| a.name == tokens[1])
                        .ok_or_else(|| syntax(fname, n, "unknown attribute"))?;
                    let vname = tokens[2];
                    if attr.values.iter().any(|v| v.name == vname) {
                        return Err(syntax(fname, n, "duplicate value name"));
                    }
                    let data = match attr.typ {
                        AttrType::Integer => ValueData::Integer(
                            tokens[3]
                                .parse()
                                .map_err(|_| syntax(fname, n, "value is not an integer"))?,
                        ),
                        AttrType::String => ValueData::String(tokens[3].to_string()),
                        AttrType::Date => ValueData::Date(
                            tokens[3]
                                .parse()
                                .map_err(|_| syntax(fname, n, "date value is not epoch seconds"))?,
                        ),
                        AttrType::IpAddr => ValueData::IpAddr(
                            tokens[3]
                                .parse()
                                .map_err(|_| syntax(fname, n, "value is not a dotted quad"))?,
                        ),
                    };
                    Arc::make_mut(attr).values.push(DictValue {
                        name: vname.to_string(),
                        data,
                    });
                }
                _ => return Err(syntax(fname, n, "unknown keyword")),
            }
        }

        self.attrs = work;
        Ok(())
    }

    /// Find an attribute by name
    pub fn find_attr(&self, name: &str) -> Option<Arc<DictAttr>> {
        self.attrs.iter().find(|a| a.name == name).cloned()
    }

    /// Find an attribute by numeric id
    pub fn find_attr_by_id(&self, id: u8) -> Option<Arc<DictAttr>> {
        self.attrs.iter().find(|a| a.id == id).cloned()
    }

    /// Number of attribute records loaded
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

fn syntax(fname: &str, line: usize, reason: &str) -> Error {
    Error::Dict {
        file: fname.to_string(),
        line,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_dict() -> Dictionary {
        let mut dict = Dictionary::new();
        dict.load_str("ATTRIBUTE Service-Type 6 integer\n", "base")
            .unwrap();
        dict
    }

    #[test]
    fn attribute_and_value_lookup() {
        let mut dict = base_dict();
        dict.load_str(
            "ATTRIBUTE User-Name 1 string\n\
             ATTRIBUTE NAS-Port 5 integer\n\
             VALUE Service-Type Framed-User 2\n",
            "test",
        )
        .unwrap();

        assert_eq!(dict.find_attr("NAS-Port").unwrap().id, 5);
        let service_type = dict.find_attr("Service-Type").unwrap();
        assert_eq!(
            service_type.find_value_by_integer(2).unwrap().name,
            "Framed-User"
        );
    }

    #[test]
    fn name_and_id_lookup_agree() {
        let mut dict = base_dict();
        dict.load_str(
            "ATTRIBUTE User-Name 1 string\nATTRIBUTE Framed-IP-Address 8 ipaddr\n",
            "test",
        )
        .unwrap();

        for name in ["Service-Type", "User-Name", "Framed-IP-Address"] {
            let by_name = dict.find_attr(name).unwrap();
            let by_id = dict.find_attr_by_id(by_name.id).unwrap();
            assert_eq!(by_name.name, by_id.name);
            assert_eq!(by_name.typ, by_id.typ);
        }
    }

    #[test]
    fn integer_value_bijection() {
        let mut dict = base_dict();
        dict.load_str(
            "VALUE Service-Type Login-User 1\n\
             VALUE Service-Type Framed-User 2\n\
             VALUE Service-Type Callback-Login-User 3\n",
            "test",
        )
        .unwrap();

        let attr = dict.find_attr("Service-Type").unwrap();
        for (name, n) in [
            ("Login-User", 1),
            ("Framed-User", 2),
            ("Callback-Login-User", 3),
        ] {
            assert_eq!(attr.find_value(name).unwrap().data, ValueData::Integer(n));
            assert_eq!(attr.find_value_by_integer(n).unwrap().name, name);
        }
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let mut dict = Dictionary::new();
        dict.load_str(
            "# leading comment\n\nATTRIBUTE User-Name 1 string\n# trailing\n",
            "test",
        )
        .unwrap();
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn dos_line_endings_tolerated() {
        let mut dict = Dictionary::new();
        dict.load_str("ATTRIBUTE User-Name 1 string\r\n", "test")
            .unwrap();
        assert!(dict.find_attr("User-Name").is_some());
    }

    #[test]
    fn malformed_line_reports_position_and_discards() {
        let mut dict = base_dict();
        let err = dict
            .load_str("ATTRIBUTE NAS-Port 5 integer\nATTRIBUTE Broken five\n", "d")
            .unwrap_err();
        match err {
            Error::Dict { file, line, .. } => {
                assert_eq!(file, "d");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected error: {other}"),
        }
        // The failed load must not leave a partial parse behind.
        assert!(dict.find_attr("NAS-Port").is_none());
        assert!(dict.find_attr("Service-Type").is_some());
    }

    #[test]
    fn unknown_type_keyword_fails() {
        let mut dict = Dictionary::new();
        assert!(dict
            .load_str("ATTRIBUTE User-Name 1 text\n", "d")
            .is_err());
    }

    #[test]
    fn non_numeric_id_fails() {
        let mut dict = Dictionary::new();
        assert!(dict
            .load_str("ATTRIBUTE User-Name one string\n", "d")
            .is_err());
    }

    #[test]
    fn value_for_unknown_attribute_fails() {
        let mut dict = Dictionary::new();
        let err = dict
            .load_str("VALUE Service-Type Framed-User 2\n", "d")
            .unwrap_err();
        assert!(matches!(err, Error::Dict { line: 1, .. }));
    }

    #[test]
    fn ipaddr_and_date_values_are_decoded() {
        let mut dict = Dictionary::new();
        dict.load_str(
            "ATTRIBUTE Login-IP-Host 14 ipaddr\n\
             ATTRIBUTE Event-Timestamp 55 date\n\
             VALUE Login-IP-Host Any 255.255.255.255\n\
             VALUE Event-Timestamp Epoch 0\n",
            "test",
        )
        .unwrap();

        let host = dict.find_attr("Login-IP-Host").unwrap();
        assert_eq!(
            host.find_value("Any").unwrap().data,
            ValueData::IpAddr(Ipv4Addr::new(255, 255, 255, 255))
        );
        let ts = dict.find_attr("Event-Timestamp").unwrap();
        assert_eq!(ts.find_value("Epoch").unwrap().data, ValueData::Date(0));
    }

    #[test]
    fn duplicate_attribute_id_fails() {
        let mut dict = Dictionary::new();
        assert!(dict
            .load_str(
                "ATTRIBUTE User-Name 1 string\nATTRIBUTE Other-Name 1 string\n",
                "d"
            )
            .is_err());
    }
}
