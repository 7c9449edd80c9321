//! In-memory unpacking of bulk distribution files
//!
//! Bulk files arrive as `.zip` archives, gzip streams or plain bytes. The
//! format is sniffed from magic bytes rather than the URL, since some
//! distribution endpoints serve archives from extensionless paths.

use crate::error::Result;
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use tracing::debug;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// One unpacked file
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub data: Vec<u8>,
}

/// Unpack `data`, keeping only `member` when given
///
/// Member names match on the final path component, case-insensitively.
/// Archive members that look like documentation (`.pdf`, `.htm`, readmes)
/// are skipped when no member is named.
pub fn unpack(data: &[u8], name: &str, member: Option<&str>) -> Result<Vec<Member>> {
    if data.starts_with(ZIP_MAGIC) {
        return unpack_zip(data, member);
    }

    if data.starts_with(GZIP_MAGIC) {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        debug!(name, compressed = data.len(), decompressed = out.len(), "Gunzipped");
        return Ok(vec![Member {
            name: name.trim_end_matches(".gz").to_string(),
            data: out,
        }]);
    }

    Ok(vec![Member {
        name: name.to_string(),
        data: data.to_vec(),
    }])
}

fn unpack_zip(data: &[u8], member: Option<&str>) -> Result<Vec<Member>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let mut members = Vec::new();

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }

        let full_name = file.name().to_string();
        let base = full_name.rsplit('/').next().unwrap_or(&full_name).to_string();

        let wanted = match member {
            Some(m) => base.eq_ignore_ascii_case(m),
            None => !is_documentation(&base),
        };
        if !wanted {
            continue;
        }

        let mut contents = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut contents)?;
        debug!(member = %base, bytes = contents.len(), "Extracted archive member");
        members.push(Member {
            name: base,
            data: contents,
        });
    }

    Ok(members)
}

fn is_documentation(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".pdf")
        || lower.ends_with(".htm")
        || lower.ends_with(".html")
        || lower.starts_with("readme")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in files {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn test_unpack_zip_selects_member() {
        let data = zip_bytes(&[
            ("ndctext/package.txt", b"PRODUCTID\tNDCPACKAGECODE\n"),
            ("ndctext/product.txt", b"PRODUCTID\tPRODUCTNDC\n"),
        ]);

        let members = unpack(&data, "ndctext.zip", Some("PRODUCT.TXT")).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "product.txt");
        assert!(members[0].data.starts_with(b"PRODUCTID\tPRODUCTNDC"));
    }

    #[test]
    fn test_unpack_zip_skips_documentation() {
        let data = zip_bytes(&[
            ("drug-label-0001-of-0001.json", b"{\"results\": []}"),
            ("README.txt", b"see website"),
        ]);
        let members = unpack(&data, "labels.zip", None).unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].name, "drug-label-0001-of-0001.json");
    }

    #[test]
    fn test_unpack_gzip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello").unwrap();
        let data = encoder.finish().unwrap();

        let members = unpack(&data, "file.json.gz", None).unwrap();
        assert_eq!(members[0].name, "file.json");
        assert_eq!(members[0].data, b"hello");
    }

    #[test]
    fn test_unpack_plain_passthrough() {
        let members = unpack(b"a~b\n1~2\n", "products.txt", None).unwrap();
        assert_eq!(members[0].data, b"a~b\n1~2\n");
    }
}
