// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Decode a UADP NetworkMessage from a hex string or a binary file and
//! print its structure.
//!
//! ```text
//! uapub-dump 7101ba08...          # hex on the command line
//! uapub-dump --file capture.bin   # raw binary file
//! ```

use std::process::ExitCode;
use uapub::protocol::uadp::{decode, DataSetPayload, NetworkMessage};

fn parse_hex(s: &str) -> Result<Vec<u8>, String> {
    let clean: String = s.chars().filter(|c| !c.is_whitespace() && *c != ':').collect();
    if clean.len() % 2 != 0 {
        return Err("odd number of hex digits".into());
    }
    (0..clean.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).map_err(|e| e.to_string()))
        .collect()
}

fn print_message(nm: &NetworkMessage) {
    println!("UADP NetworkMessage (version {})", nm.version);
    if let Some(pid) = &nm.publisher_id {
        println!("  PublisherId:      {}", pid);
    }
    if nm.group_header_enabled {
        let gh = &nm.group_header;
        if gh.writer_group_id_enabled {
            println!("  WriterGroupId:    {}", gh.writer_group_id);
        }
        if gh.group_version_enabled {
            println!("  GroupVersion:     {}", gh.group_version);
        }
        if gh.sequence_number_enabled {
            println!("  SequenceNumber:   {}", gh.sequence_number);
        }
    }
    if nm.timestamp_enabled {
        println!("  Timestamp:        {} (unix {})", nm.timestamp.0, nm.timestamp.as_unix_seconds());
    }
    if nm.security_enabled {
        let sh = &nm.security_header;
        println!(
            "  Security:         signed={} encrypted={} tokenId={} nonce={}B",
            sh.message_signed,
            sh.message_encrypted,
            sh.token_id,
            sh.nonce.len()
        );
    }
    if nm.promoted_fields_enabled {
        println!("  PromotedFields:   {}", nm.promoted_fields.len());
    }
    println!("  DataSetMessages:  {}", nm.messages.len());
    for (i, dsm) in nm.messages.iter().enumerate() {
        let writer = nm
            .writer_id_at(i)
            .map(|id| format!(" writerId={}", id))
            .unwrap_or_default();
        let kind = match &dsm.payload {
            DataSetPayload::KeyFrame(f) => format!("KeyFrame ({} fields)", f.len()),
            DataSetPayload::DeltaFrame(f) => format!("DeltaFrame ({} fields)", f.len()),
            DataSetPayload::KeepAlive => "KeepAlive".into(),
            DataSetPayload::RawKeyFrame(b) => format!("RawKeyFrame ({} bytes)", b.len()),
        };
        println!("    [{}]{} {:?} {}", i, writer, dsm.header.field_encoding, kind);
        match &dsm.payload {
            DataSetPayload::KeyFrame(fields) => {
                for (fi, dv) in fields.iter().enumerate() {
                    println!("        field {}: {:?}", fi, dv.value);
                }
            }
            DataSetPayload::DeltaFrame(fields) => {
                for (index, dv) in fields {
                    println!("        field {}: {:?}", index, dv.value);
                }
            }
            _ => {}
        }
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let bytes = match args.as_slice() {
        [flag, path] if flag == "--file" => {
            std::fs::read(path).map_err(|e| format!("cannot read {}: {}", path, e))?
        }
        [hex] => parse_hex(hex)?,
        _ => {
            return Err("usage: uapub-dump <hex> | uapub-dump --file <path>".into());
        }
    };

    let nm = decode::decode(&bytes, &[])
        .map_err(|e| format!("not a decodable NetworkMessage: {}", e))?;
    print_message(&nm);
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{}", msg);
            ExitCode::FAILURE
        }
    }
}
