/// Read / write voxel buffers as headerless little-endian `f32` streams

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

type IORes<T> = std::io::Result<T>;

pub fn write(data: impl Iterator<Item = f32>, path: &Path) -> IORes<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() { std::fs::create_dir_all(dir)? }
    }
    let mut buf = BufWriter::new(File::create(path)?);
    for datum in data {
        buf.write_all(&datum.to_le_bytes())?;
    }
    buf.flush()
}

pub fn read<'a>(path: &Path) -> IORes<impl Iterator<Item = IORes<f32>> + 'a> {
    let mut buf = BufReader::new(File::open(path)?);
    let mut bytes = [0; 4];

    Ok(std::iter::from_fn(move || {
        use std::io::ErrorKind::UnexpectedEof;
        match buf.read_exact(&mut bytes) {
            Ok(()) => Some(Ok(f32::from_le_bytes(bytes))),
            Err(e) if e.kind() == UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    #[test]
    fn raw_io_roundtrip() -> IORes<()> {
        let dir = tempdir()?;
        // Missing parent directories are created on write
        let file_path = dir.path().join("nested/ct.raw");

        let original = vec![-1000.0, 0.0, 12.5, 3.0e7];
        write(original.iter().copied(), &file_path)?;

        let reloaded: Vec<_> = read(&file_path)?.collect::<Result<_, _>>()?;
        assert_eq!(original, reloaded);
        Ok(())
    }

    #[test]
    fn trailing_partial_value_is_ignored() -> IORes<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("short.raw");
        std::fs::write(&file_path, [0, 0, 128, 63, 1, 2])?;
        let reloaded: Vec<_> = read(&file_path)?.collect::<Result<_, _>>()?;
        assert_eq!(reloaded, vec![1.0]);
        Ok(())
    }
}
