//! CRC32 and ed2k content fingerprints.
//!
//! The ed2k hash is the eDonkey2000 two-level MD4: the file is cut in blocks
//! of 9,728,000 bytes, each block is MD4-hashed, and the file hash is the MD4
//! of the concatenated block digests. A single-block file's hash is the block
//! digest itself, and the empty file has no ed2k hash at all.

use std::{fs::File, io, io::Read, path::Path};

use md4::{Digest, Md4};

/// Size of one ed2k block.
pub const ED2K_BLOCK: usize = 9_728_000;

/// Compute the (crc, ed2k) fingerprint of a file by streaming it once.
///
/// Both values are rendered as lowercase hex, the CRC zero-padded to eight
/// characters. Empty files are rejected with an error.
pub fn crc_and_ed2k(path: &Path) -> io::Result<(String, String)> {
    let mut file = File::open(path)?;
    let mut block = vec![0u8; ED2K_BLOCK];
    let mut crc = crc32fast::Hasher::new();
    let mut digests: Vec<[u8; 16]> = Vec::new();

    loop {
        let filled = read_block(&mut file, &mut block)?;
        if filled == 0 {
            break;
        }
        crc.update(&block[..filled]);
        digests.push(Md4::digest(&block[..filled]).into());
        if filled < ED2K_BLOCK {
            break;
        }
    }

    let crc = format!("{:08x}", crc.finalize());
    let ed2k = match digests.len() {
        0 => return Err(io::Error::new(io::ErrorKind::InvalidData, "empty file")),
        1 => hex::encode(digests[0]),
        _ => {
            let mut outer = Md4::new();
            for digest in &digests {
                outer.update(digest);
            }
            hex::encode(outer.finalize())
        }
    };
    Ok((crc, ed2k))
}

/// Fill `block` from the reader, short only at end of file.
fn read_block<R: Read>(reader: &mut R, block: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < block.len() {
        match reader.read(&mut block[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn hash_content(content: &[u8]) -> io::Result<(String, String)> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        fs::write(&path, content).unwrap();
        crc_and_ed2k(&path)
    }

    #[test]
    fn small_text() {
        let (crc, ed2k) =
            hash_content(b"The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(crc, "414fa339");
        assert_eq!(ed2k, "1bee69a46ba811185c194762abaeae90");
    }

    #[test]
    fn one_zeroed_block() {
        let (crc, ed2k) = hash_content(&vec![0u8; ED2K_BLOCK]).unwrap();
        assert_eq!(crc, "3abc06ba");
        assert_eq!(ed2k, "d7def262a127cd79096a108e7a9fc138");
    }

    #[test]
    fn two_zeroed_blocks() {
        let (crc, ed2k) = hash_content(&vec![0u8; 2 * ED2K_BLOCK]).unwrap();
        assert_eq!(crc, "adccde1a");
        assert_eq!(ed2k, "194ee9e4fa79b2ee9f8829284c466051");
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(hash_content(b"").is_err());
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(crc_and_ed2k(&dir.path().join("nope")).is_err());
    }
}
