/// Read / write MetaImage (`.mha`) files: a text header followed by the
/// voxel values, little-endian, in the same file.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::index::Dim3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType { UChar, Short, UShort, UInt, Float }

impl ElementType {
    fn name(self) -> &'static str {
        match self {
            Self::UChar  => "MET_UCHAR",
            Self::Short  => "MET_SHORT",
            Self::UShort => "MET_USHORT",
            Self::UInt   => "MET_UINT",
            Self::Float  => "MET_FLOAT",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "MET_UCHAR"  => Self::UChar,
            "MET_SHORT"  => Self::Short,
            "MET_USHORT" => Self::UShort,
            "MET_UINT"   => Self::UInt,
            "MET_FLOAT"  => Self::Float,
            _ => return None,
        })
    }

    fn size(self) -> usize {
        match self {
            Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::UInt | Self::Float => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub dim: Dim3,
    pub offset: [f64; 3],
    pub spacing: [f64; 3],
    /// Values per voxel, interleaved
    pub channels: usize,
    pub element: ElementType,
}

impl Header {
    fn values(&self) -> usize { self.dim.iter().product::<usize>() * self.channels }
}

pub fn write(header: &Header, data: impl Iterator<Item = f32>, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() { std::fs::create_dir_all(dir)? }
    }
    let mut buf = BufWriter::new(File::create(path)?);
    let [o, s, d] = [header.offset, header.spacing, header.dim.map(|n| n as f64)];
    writeln!(buf, "ObjectType = Image")?;
    writeln!(buf, "NDims = 3")?;
    writeln!(buf, "BinaryData = True")?;
    writeln!(buf, "BinaryDataByteOrderMSB = False")?;
    writeln!(buf, "TransformMatrix = 1 0 0 0 1 0 0 0 1")?;
    writeln!(buf, "Offset = {} {} {}", o[0], o[1], o[2])?;
    writeln!(buf, "CenterOfRotation = 0 0 0")?;
    writeln!(buf, "ElementSpacing = {} {} {}", s[0], s[1], s[2])?;
    writeln!(buf, "DimSize = {} {} {}", d[0], d[1], d[2])?;
    writeln!(buf, "AnatomicalOrientation = RAI")?;
    if header.channels != 1 {
        writeln!(buf, "ElementNumberOfChannels = {}", header.channels)?;
    }
    writeln!(buf, "ElementType = {}", header.element.name())?;
    writeln!(buf, "ElementDataFile = LOCAL")?;
    for v in data {
        match header.element {
            ElementType::UChar  => buf.write_all(&(v as u8 ).to_le_bytes())?,
            ElementType::Short  => buf.write_all(&(v as i16).to_le_bytes())?,
            ElementType::UShort => buf.write_all(&(v as u16).to_le_bytes())?,
            ElementType::UInt   => buf.write_all(&(v as u32).to_le_bytes())?,
            ElementType::Float  => buf.write_all(&v.to_le_bytes())?,
        }
    }
    buf.flush()?;
    Ok(())
}

pub fn read(path: &Path) -> Result<(Header, Vec<f32>)> {
    let parse_error = |message: String| Error::Parse { path: path.into(), message };
    let mut reader = BufReader::new(File::open(path)?);

    let mut dim = None;
    let mut offset = [0.0; 3];
    let mut spacing = [1.0; 3];
    let mut channels = 1;
    let mut element = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(parse_error("header ends before ElementDataFile".into()));
        }
        let Some((key, value)) = line.split_once('=') else { continue };
        let (key, value) = (key.trim(), value.trim());
        let bad = || parse_error(format!("`{key} = {value}`"));
        match key {
            "NDims"                  => if value != "3" { return Err(bad()) },
            "BinaryDataByteOrderMSB" => if value.eq_ignore_ascii_case("true") { return Err(bad()) },
            "DimSize"                => dim = Some(triplet::<usize>(value).ok_or_else(bad)?),
            "Offset" | "Position"    => offset = triplet(value).ok_or_else(bad)?,
            "ElementSpacing"         => spacing = triplet(value).ok_or_else(bad)?,
            "ElementNumberOfChannels"=> channels = value.parse().map_err(|_| bad())?,
            "ElementType"            => element = Some(ElementType::parse(value).ok_or_else(bad)?),
            "ElementDataFile"        => if value == "LOCAL" { break } else { return Err(bad()) },
            _ => {},
        }
    }
    let header = Header {
        dim: dim.ok_or_else(|| parse_error("no DimSize".into()))?,
        offset,
        spacing,
        channels,
        element: element.ok_or_else(|| parse_error("no ElementType".into()))?,
    };

    let size = header.element.size();
    let mut bytes = vec![0; header.values() * size];
    reader.read_exact(&mut bytes)
        .map_err(|e| parse_error(format!("expected {} values: {e}", header.values())))?;
    let data = bytes.chunks_exact(size).map(|b| match header.element {
        ElementType::UChar  => b[0] as f32,
        ElementType::Short  => i16::from_le_bytes([b[0], b[1]]) as f32,
        ElementType::UShort => u16::from_le_bytes([b[0], b[1]]) as f32,
        ElementType::UInt   => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32,
        ElementType::Float  => f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
    }).collect();
    Ok((header, data))
}

fn triplet<T: std::str::FromStr>(s: &str) -> Option<[T; 3]> {
    let mut it = s.split_whitespace().map(str::parse::<T>);
    let t = [it.next()?.ok()?, it.next()?.ok()?, it.next()?.ok()?];
    it.next().is_none().then_some(t)
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;
    #[allow(unused)] use pretty_assertions::{assert_eq, assert_ne};

    fn header(element: ElementType, channels: usize) -> Header {
        Header { dim: [3, 2, 1], offset: [-1.5, 0.0, 2.25], spacing: [0.5, 1.0, 2.5], channels, element }
    }

    #[test]
    fn float_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("img.mha");
        let data = vec![-1000.0, 0.5, 3.0, 4.0, 5.0, 1e6];
        write(&header(ElementType::Float, 1), data.iter().copied(), &path)?;
        let (h, back) = read(&path)?;
        assert_eq!(h, header(ElementType::Float, 1));
        assert_eq!(back, data);
        Ok(())
    }

    #[test]
    fn short_vector_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("vf.mha");
        let data: Vec<f32> = (0..18).map(|n| n as f32 - 9.0).collect();
        write(&header(ElementType::Short, 3), data.iter().copied(), &path)?;
        let (h, back) = read(&path)?;
        assert_eq!(h.channels, 3);
        assert_eq!(back, data);
        Ok(())
    }

    #[test]
    fn header_layout() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("img.mha");
        write(&header(ElementType::UChar, 1), std::iter::repeat(1.0).take(6), &path)?;
        let bytes = std::fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("DimSize = 3 2 1\n"));
        assert!(text.contains("Offset = -1.5 0 2.25\n"));
        assert!(text.contains("ElementType = MET_UCHAR\nElementDataFile = LOCAL\n"));
        assert!(bytes.ends_with(&[1; 6]));
        Ok(())
    }

    #[test]
    fn truncated_data_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("short.mha");
        write(&header(ElementType::Float, 1), [1.0, 2.0].into_iter(), &path)?;
        assert!(matches!(read(&path), Err(Error::Parse { .. })));
        Ok(())
    }
}
