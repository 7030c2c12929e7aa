//! util — позиционный ввод/вывод и мелкие хелперы отображения (CLI).
//!
//! read_at/write_at не двигают курсор файла, поэтому безопасны при
//! параллельном использовании одного `File` из нескольких потоков.

use std::fs::File;
use std::io;

#[cfg(unix)]
pub fn read_at(f: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub fn write_at(f: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    f.write_all_at(buf, offset)
}

#[cfg(windows)]
pub fn read_at(f: &File, mut offset: u64, mut buf: &mut [u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_read(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short positional read"));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
pub fn write_at(f: &File, mut offset: u64, mut buf: &[u8]) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = f.seek_write(buf, offset)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short positional write"));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

/// Округлить `v` вверх до кратного `step` (step > 0).
#[inline]
pub fn round_up(v: u64, step: u64) -> u64 {
    v.div_ceil(step) * step
}

pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            if i % 16 == 0 {
                out.push('\n');
            } else {
                out.push(' ');
            }
        }
        out.push_str(&format!("{:02x}", b));
    }
    out
}

pub fn display_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => format!("(binary {} B)", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_works() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(8192, 4096), 8192);
    }

    #[test]
    fn positional_io_roundtrip() {
        let path = std::env::temp_dir().join(format!(
            "qlite-util-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let f = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        write_at(&f, 100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        read_at(&f, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        drop(f);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn display_text_binary() {
        assert_eq!(display_text(b"abc"), "abc");
        assert_eq!(display_text(&[0xff, 0xfe]), "(binary 2 B)");
    }
}
