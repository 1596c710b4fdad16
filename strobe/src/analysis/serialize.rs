//! Artifact serialization: protobuf encoding behind a zstd stream, with
//! the unwind table delta-encoded for transmission.

use std::io::{Read, Write};

use prost::Message;
use thiserror::Error;

use crate::analysis::proto;
use crate::analysis::table::{delta_encode, integrate_unwind_table, UnwindTableError};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Table(#[from] UnwindTableError),
}

pub fn serialize_binary_analysis(
    mut analysis: proto::BinaryAnalysis,
    writer: &mut impl Write,
) -> Result<(), AnalysisError> {
    delta_encode(&mut analysis.unwind_table)?;

    let encoded = analysis.encode_to_vec();
    let compressed = zstd::stream::encode_all(&encoded[..], 0)?;
    writer.write_all(&compressed)?;
    Ok(())
}

pub fn deserialize_binary_analysis(
    reader: &mut impl Read,
) -> Result<proto::BinaryAnalysis, AnalysisError> {
    let decompressed = zstd::stream::decode_all(reader)?;
    let mut analysis = proto::BinaryAnalysis::decode(&decompressed[..])?;
    integrate_unwind_table(&mut analysis.unwind_table)?;
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::proto::unwind_rule::Kind;
    use crate::analysis::table::RuleDictBuilder;

    fn sample_analysis() -> proto::BinaryAnalysis {
        let mut dict_builder = RuleDictBuilder::new();
        let cfa = dict_builder.add(proto::UnwindRule {
            dereference: false,
            kind: Some(Kind::RegisterOffset(proto::RegisterOffset {
                register: 7,
                offset: 8,
            })),
        });
        let ra = dict_builder.add(proto::UnwindRule {
            dereference: false,
            kind: Some(Kind::CfaMinus8(proto::CfaMinus8 {})),
        });
        let dict = dict_builder.finish();

        let mut unwind_table = proto::UnwindTable {
            start_pc: vec![0x1000, 0x2000],
            pc_range: vec![0x800, 0x100],
            cfa: vec![cfa; 2],
            rbp: vec![cfa; 2],
            ra: vec![ra; 2],
            dict: Vec::new(),
        };
        dict.remap_rules(&mut unwind_table.cfa);
        dict.remap_rules(&mut unwind_table.rbp);
        dict.remap_rules(&mut unwind_table.ra);
        unwind_table.dict = dict.into_rules();

        proto::BinaryAnalysis {
            unwind_table,
            tls_config: proto::TlsConfig {
                variables: vec![proto::TlsVariable {
                    offset: 0x100,
                    name: "request_id".to_string(),
                }],
            },
            python_config: proto::PythonConfig {
                version: Some(proto::PythonVersion {
                    major: 3,
                    minor: 12,
                    micro: 1,
                }),
                py_thread_state_tls_offset: 0x40,
                relative_py_runtime_address: 0x7e0000,
            },
        }
    }

    #[test]
    fn serialization_round_trips() {
        let analysis = sample_analysis();

        let mut bytes = Vec::new();
        serialize_binary_analysis(analysis.clone(), &mut bytes).unwrap();
        let decoded = deserialize_binary_analysis(&mut &bytes[..]).unwrap();

        // Integration restored the absolute row addresses.
        assert_eq!(decoded, analysis);
    }

    #[test]
    fn compressed_artifact_is_not_raw_protobuf() {
        let analysis = sample_analysis();
        let raw = analysis.encode_to_vec();

        let mut bytes = Vec::new();
        serialize_binary_analysis(analysis, &mut bytes).unwrap();
        assert_ne!(bytes, raw);
        // zstd frame magic.
        assert_eq!(&bytes[..4], &[0x28, 0xb5, 0x2f, 0xfd]);
    }
}
