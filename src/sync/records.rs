//! Translation of Handshake resource data into materialized DNS records.

use std::net::{Ipv4Addr, Ipv6Addr};

use data_encoding::BASE32HEX_NOPAD;

use crate::handshake::resource::{Resource, ResourceRecord};
use crate::store::Record;

/// Canonical owner form: lowercase with a trailing dot.
pub fn canonicalize(domain: &str) -> String {
    let mut owner = domain.to_lowercase();

    if !owner.ends_with('.') {
        owner.push('.');
    }

    owner
}

fn synth_name4(address: &Ipv4Addr) -> String {
    format!(
        "_{}._synth.",
        BASE32HEX_NOPAD.encode(&address.octets()).to_lowercase()
    )
}

fn synth_name6(address: &Ipv6Addr) -> String {
    format!(
        "_{}._synth.",
        BASE32HEX_NOPAD.encode(&address.octets()).to_lowercase()
    )
}

/// Materialize the DNS records for `domain` described by `resource`.
pub fn records_for_domain(domain: &str, resource: &Resource) -> Vec<Record> {
    let owner = canonicalize(domain);
    let mut records = Vec::new();

    for entry in &resource.records {
        match entry {
            ResourceRecord::Ds {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => {
                records.push(Record::new(
                    owner.clone(),
                    "DS",
                    format!(
                        "{} {} {} {}",
                        key_tag,
                        algorithm,
                        digest_type,
                        hex::encode(digest)
                    ),
                ));
            }
            ResourceRecord::Ns { name } => {
                records.push(Record::new(owner.clone(), "NS", name.clone()));
            }
            ResourceRecord::Glue4 { name, address } => {
                records.push(Record::new(owner.clone(), "NS", name.clone()));
                records.push(Record::new(name.clone(), "A", address.to_string()));
            }
            ResourceRecord::Glue6 { name, address } => {
                records.push(Record::new(owner.clone(), "NS", name.clone()));
                records.push(Record::new(name.clone(), "AAAA", address.to_string()));
            }
            ResourceRecord::Synth4 { address } => {
                let ns = synth_name4(address);
                records.push(Record::new(owner.clone(), "NS", ns.clone()));
                records.push(Record::new(ns, "A", address.to_string()));
            }
            ResourceRecord::Synth6 { address } => {
                let ns = synth_name6(address);
                records.push(Record::new(owner.clone(), "NS", ns.clone()));
                records.push(Record::new(ns, "AAAA", address.to_string()));
            }
            ResourceRecord::Text { items } => {
                let rhs = items
                    .iter()
                    .map(|item| format!("\"{}\"", String::from_utf8_lossy(item)))
                    .collect::<Vec<_>>()
                    .join(" ");

                records.push(Record::new(owner.clone(), "TXT", rhs));
            }
        }
    }

    records
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_owner_has_trailing_dot() {
        assert_eq!(canonicalize("Trees"), "trees.");
        assert_eq!(canonicalize("trees."), "trees.");
    }

    #[test]
    fn glue_emits_delegation_plus_address() {
        let resource = Resource {
            records: vec![ResourceRecord::Glue4 {
                name: "ns1.irvwilliam.".into(),
                address: Ipv4Addr::new(10, 0, 0, 1),
            }],
        };

        let records = records_for_domain("irvwilliam", &resource);

        assert_eq!(
            records,
            vec![
                Record::new("irvwilliam.", "NS", "ns1.irvwilliam."),
                Record::new("ns1.irvwilliam.", "A", "10.0.0.1"),
            ]
        );
    }

    #[test]
    fn synth_names_use_lowercase_base32hex() {
        let resource = Resource {
            records: vec![ResourceRecord::Synth4 {
                address: Ipv4Addr::new(1, 2, 3, 4),
            }],
        };

        let records = records_for_domain("trees.", &resource);

        assert_eq!(records[0], Record::new("trees.", "NS", "_0410610._synth."));
        assert_eq!(
            records[1],
            Record::new("_0410610._synth.", "A", "1.2.3.4")
        );
    }

    #[test]
    fn ds_rhs_layout() {
        let resource = Resource {
            records: vec![ResourceRecord::Ds {
                key_tag: 54_616,
                algorithm: 13,
                digest_type: 2,
                digest: vec![0xde, 0xad],
            }],
        };

        let records = records_for_domain("trees.", &resource);
        assert_eq!(records, vec![Record::new("trees.", "DS", "54616 13 2 dead")]);
    }

    #[test]
    fn text_items_are_quoted() {
        let resource = Resource {
            records: vec![ResourceRecord::Text {
                items: vec![b"hello".to_vec(), b"world".to_vec()],
            }],
        };

        let records = records_for_domain("trees.", &resource);
        assert_eq!(
            records,
            vec![Record::new("trees.", "TXT", "\"hello\" \"world\"")]
        );
    }
}
