// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The line-oriented file-map text format described in the external
//! interfaces: `<path>, <flags>, <revision>[, <checksum>[, <size>]]`,
//! with `# ...` comment lines preserved verbatim at the head.

use std::io::{self, BufRead, Write};

use super::{Error, Filter, Flags, Kind, Node, Tree};

/// Parse `reader` into a [`Tree`]. Leading comment lines are returned
/// alongside the tree so callers can round-trip them via [`write_text`].
pub fn read_text(reader: impl BufRead) -> Result<(Vec<String>, Tree), Error> {
    let mut comments = Vec::new();
    let mut tree = Tree::new();
    let mut in_header = true;

    for line in reader.lines() {
        let line = line.map_err(|e| Error::Parse(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with('#') {
            if in_header {
                comments.push(line);
            }
            continue;
        }
        in_header = false;

        let node = parse_line(&line)?;
        let path = node.0.clone();
        tree.new_item_at_path(&path, node.1, true)?;
    }

    Ok((comments, tree))
}

fn parse_line(line: &str) -> Result<(String, Node), Error> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 3 || fields.len() > 5 {
        return Err(Error::Parse(format!("malformed line: {line}")));
    }

    let path = fields[0].to_string();
    let flag_field = fields[1];
    let revision: u64 = fields[2]
        .parse()
        .map_err(|_| Error::Parse(format!("bad revision in line: {line}")))?;

    let kind = flag_field
        .chars()
        .find_map(|c| match c {
            'd' => Some(Kind::Dir),
            'f' => Some(Kind::File),
            's' => Some(Kind::Symlink),
            _ => None,
        })
        .ok_or_else(|| Error::Parse(format!("unknown kind in flags {flag_field:?}")))?;

    for c in flag_field.chars() {
        if !matches!(c, 'd' | 'f' | 's' | 'x') {
            return Err(Error::Parse(format!("unknown flag char {c:?} in {flag_field:?}")));
        }
    }

    let mut flags = Flags::empty();
    if flag_field.contains('x') {
        flags |= Flags::EXECUTABLE;
    }

    let checksum = fields.get(3).filter(|s| !s.is_empty()).map(|s| s.to_string());
    let size = fields
        .get(4)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u64>())
        .transpose()
        .map_err(|_| Error::Parse(format!("bad size in line: {line}")))?;

    if matches!(kind, Kind::File) && revision > 0 && checksum.is_none() {
        return Err(Error::Parse(format!(
            "file with revision > 0 must carry a checksum: {line}"
        )));
    }

    let name = path.rsplit('/').next().unwrap_or(&path).to_string();
    let mut node = Node::new(name, kind);
    node.revision = revision;
    node.checksum = checksum;
    node.size = size;
    node.flags = flags;

    Ok((path, node))
}

/// Serialize `tree` in pre-order, directories and files interleaved
/// lexicographically (no "dirs first" rule).
pub fn write_text(mut writer: impl Write, comments: &[String], tree: &Tree) -> io::Result<()> {
    for comment in comments {
        writeln!(writer, "{comment}")?;
    }

    for (path, node) in tree.walk(Filter::Any) {
        let mut flag_field = String::new();
        flag_field.push(match node.kind {
            Kind::Dir => 'd',
            Kind::File => 'f',
            Kind::Symlink => 's',
        });
        if node.flags.contains(Flags::EXECUTABLE) {
            flag_field.push('x');
        }

        write!(writer, "{path}, {flag_field}, {}", node.revision)?;
        if let Some(checksum) = &node.checksum {
            write!(writer, ", {checksum}")?;
            if let Some(size) = node.size {
                write!(writer, ", {size}")?;
            }
        }
        writeln!(writer)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trips_through_text_format() {
        let mut tree = Tree::new();
        let mut file = Node::new("foo", Kind::File);
        file.revision = 7;
        file.checksum = Some("abc123".to_string());
        tree.new_item_at_path("dir/foo", file, true).unwrap();

        let mut buf = Vec::new();
        write_text(&mut buf, &["# a comment".to_string()], &tree).unwrap();

        let (comments, parsed) = read_text(Cursor::new(buf)).unwrap();
        assert_eq!(comments, vec!["# a comment".to_string()]);
        assert_eq!(
            parsed.get_item_at_path("dir/foo").unwrap().checksum.as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn unknown_flag_char_is_parse_error() {
        let input = "foo, z, 1\n";
        let result = read_text(Cursor::new(input));
        assert!(result.is_err());
    }
}
