use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{bail, Context, Result};
use ground_core::{classification::PointClass, nalgebra::Point3};

/// Reads `x y z` positions, one point per line. Columns after the third are ignored, as are empty lines and
/// lines starting with `#`. Values may be separated by whitespace or commas
pub fn read_positions<R: BufRead>(read: R) -> Result<Vec<Point3<f64>>> {
    let mut positions = vec![];
    for (line_idx, line) in read.lines().enumerate() {
        let line = line.with_context(|| format!("Could not read line {}", line_idx + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut values = line
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|token| !token.is_empty());
        let mut coordinate = |name: char| -> Result<f64> {
            let token = match values.next() {
                Some(token) => token,
                None => bail!("Line {} has no {} coordinate", line_idx + 1, name),
            };
            token
                .parse::<f64>()
                .with_context(|| format!("Could not parse {} coordinate '{}' in line {}", name, token, line_idx + 1))
        };
        let x = coordinate('x')?;
        let y = coordinate('y')?;
        let z = coordinate('z')?;
        positions.push(Point3::new(x, y, z));
    }
    Ok(positions)
}

/// Reads all positions from the file at `path`
pub fn read_positions_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<Point3<f64>>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Could not open {}", path.display()))?;
    read_positions(BufReader::new(file))
        .with_context(|| format!("Could not read points from {}", path.display()))
}

/// Writes `x y z class` lines, with the LAS code of each class
pub fn write_classified<W: Write>(
    write: W,
    positions: &[Point3<f64>],
    classes: &[PointClass],
    precision: usize,
) -> Result<()> {
    if positions.len() != classes.len() {
        bail!(
            "Got {} classes for {} points",
            classes.len(),
            positions.len()
        );
    }
    let mut writer = BufWriter::new(write);
    for (pos, class) in positions.iter().zip(classes) {
        writeln!(
            writer,
            "{:.prec$} {:.prec$} {:.prec$} {}",
            pos.x,
            pos.y,
            pos.z,
            class.las_code(),
            prec = precision
        )?;
    }
    writer.flush().context("Could not flush classified points")?;
    Ok(())
}

/// Writes the classified points into a new file at `path`
pub fn write_classified_to_file<P: AsRef<Path>>(
    path: P,
    positions: &[Point3<f64>],
    classes: &[PointClass],
    precision: usize,
) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Could not create {}", path.display()))?;
    write_classified(file, positions, classes, precision)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn test_read_skips_comments_and_extra_columns() -> Result<()> {
        let text = "# x y z intensity\n1 2 3 17\n\n4.5,5.5,6.5\n";
        let positions = read_positions(Cursor::new(text))?;
        assert_eq!(
            positions,
            vec![Point3::new(1.0, 2.0, 3.0), Point3::new(4.5, 5.5, 6.5)]
        );
        Ok(())
    }

    #[test]
    fn test_read_reports_bad_lines() {
        let err = read_positions(Cursor::new("1 2 3\n1 2\n")).unwrap_err();
        assert!(format!("{:#}", err).contains("Line 2"));
        assert!(read_positions(Cursor::new("1 two 3\n")).is_err());
    }

    #[test]
    fn test_write_classified() -> Result<()> {
        let mut out: Vec<u8> = vec![];
        write_classified(
            &mut out,
            &[Point3::new(1.0, 2.0, 3.25), Point3::new(0.0, 0.0, 0.0)],
            &[PointClass::Ground, PointClass::NonGround],
            2,
        )?;
        let text = String::from_utf8(out)?;
        let ground = PointClass::Ground.las_code();
        let non_ground = PointClass::NonGround.las_code();
        assert_eq!(
            text,
            format!("1.00 2.00 3.25 {}\n0.00 0.00 0.00 {}\n", ground, non_ground)
        );
        assert!(write_classified(Vec::<u8>::new(), &[Point3::origin()], &[], 2).is_err());
        Ok(())
    }
}
