//! Line-based diffing
//!
//! Used both to score disassembly against the target and to render the
//! `diff.txt` saved next to every recorded candidate. The algorithm is a
//! longest-common-subsequence walk after trimming the shared prefix and
//! suffix, which keeps the table small for the near-identical inputs the
//! search produces.

/// One step of an edit script from `old` to `new`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp<'a> {
    Equal(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Lines of context around each change in unified output
const CONTEXT: usize = 3;

/// Above this many table cells the middle section is reported as a plain
/// replacement instead of being aligned
const MAX_TABLE_CELLS: usize = 16 * 1024 * 1024;

/// Compute an edit script turning `old` into `new`
pub fn diff_lines<'a, S: AsRef<str>>(old: &'a [S], new: &'a [S]) -> Vec<DiffOp<'a>> {
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a.as_ref() == b.as_ref())
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a.as_ref() == b.as_ref())
        .count();

    let a = &old[prefix..old.len() - suffix];
    let b = &new[prefix..new.len() - suffix];

    let mut ops = Vec::with_capacity(old.len().max(new.len()));
    ops.extend(old[..prefix].iter().map(|line| DiffOp::Equal(line.as_ref())));

    if a.len().saturating_mul(b.len()) > MAX_TABLE_CELLS {
        ops.extend(a.iter().map(|line| DiffOp::Delete(line.as_ref())));
        ops.extend(b.iter().map(|line| DiffOp::Insert(line.as_ref())));
    } else {
        align(a, b, &mut ops);
    }

    ops.extend(old[old.len() - suffix..].iter().map(|line| DiffOp::Equal(line.as_ref())));
    ops
}

fn align<'a, S: AsRef<str>>(a: &'a [S], b: &'a [S], ops: &mut Vec<DiffOp<'a>>) {
    let (n, m) = (a.len(), b.len());
    let width = m + 1;
    // lcs[i * width + j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if a[i].as_ref() == b[j].as_ref() {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i].as_ref() == b[j].as_ref() {
            ops.push(DiffOp::Equal(a[i].as_ref()));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push(DiffOp::Delete(a[i].as_ref()));
            i += 1;
        } else {
            ops.push(DiffOp::Insert(b[j].as_ref()));
            j += 1;
        }
    }
    ops.extend(a[i..].iter().map(|line| DiffOp::Delete(line.as_ref())));
    ops.extend(b[j..].iter().map(|line| DiffOp::Insert(line.as_ref())));
}

/// Render a unified diff between two texts, empty when they match
pub fn unified_diff(old_text: &str, new_text: &str, old_name: &str, new_name: &str) -> String {
    let old: Vec<&str> = old_text.lines().collect();
    let new: Vec<&str> = new_text.lines().collect();
    let ops = diff_lines(&old, &new);

    // Line positions before each op
    let mut positions = Vec::with_capacity(ops.len() + 1);
    let (mut old_pos, mut new_pos) = (0usize, 0usize);
    for op in &ops {
        positions.push((old_pos, new_pos));
        match op {
            DiffOp::Equal(_) => {
                old_pos += 1;
                new_pos += 1;
            }
            DiffOp::Delete(_) => old_pos += 1,
            DiffOp::Insert(_) => new_pos += 1,
        }
    }

    let changes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, DiffOp::Equal(_)))
        .map(|(idx, _)| idx)
        .collect();
    if changes.is_empty() {
        return String::new();
    }

    // Merge change neighbourhoods into hunks of op indices
    let mut hunks: Vec<(usize, usize)> = Vec::new();
    for &idx in &changes {
        let start = idx.saturating_sub(CONTEXT);
        let end = (idx + CONTEXT + 1).min(ops.len());
        match hunks.last_mut() {
            Some(last) if start <= last.1 => last.1 = end,
            _ => hunks.push((start, end)),
        }
    }

    let mut out = format!("--- {}\n+++ {}\n", old_name, new_name);
    for (start, end) in hunks {
        let slice = &ops[start..end];
        let old_count = slice.iter().filter(|op| !matches!(op, DiffOp::Insert(_))).count();
        let new_count = slice.iter().filter(|op| !matches!(op, DiffOp::Delete(_))).count();
        let (old_start, new_start) = positions[start];
        out.push_str(&format!(
            "@@ -{} +{} @@\n",
            hunk_range(old_start, old_count),
            hunk_range(new_start, new_count)
        ));
        for op in slice {
            let (prefix, line) = match op {
                DiffOp::Equal(line) => (' ', line),
                DiffOp::Delete(line) => ('-', line),
                DiffOp::Insert(line) => ('+', line),
            };
            out.push(prefix);
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn hunk_range(start: usize, count: usize) -> String {
    match count {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, count),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_inputs() {
        let lines = ["a", "b", "c"];
        let ops = diff_lines(&lines, &lines);
        assert!(ops.iter().all(|op| matches!(op, DiffOp::Equal(_))));
        assert_eq!(unified_diff("a\nb\n", "a\nb\n", "x", "y"), "");
    }

    #[test]
    fn test_replacement_in_middle() {
        let old = ["int a;", "a = 1;", "return a;"];
        let new = ["int a;", "a = 2;", "return a;"];
        let ops = diff_lines(&old, &new);
        assert_eq!(
            ops,
            vec![
                DiffOp::Equal("int a;"),
                DiffOp::Delete("a = 1;"),
                DiffOp::Insert("a = 2;"),
                DiffOp::Equal("return a;"),
            ]
        );
    }

    #[test]
    fn test_insertions_and_deletions_align() {
        let old = ["x", "a", "b", "c", "y"];
        let new = ["x", "b", "c", "d", "y"];
        let ops = diff_lines(&old, &new);
        let deleted: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                DiffOp::Delete(line) => Some(*line),
                _ => None,
            })
            .collect();
        let inserted: Vec<&str> = ops
            .iter()
            .filter_map(|op| match op {
                DiffOp::Insert(line) => Some(*line),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["a"]);
        assert_eq!(inserted, vec!["d"]);
    }

    #[test]
    fn test_unified_output() {
        let diff = unified_diff("a\nb\nc\n", "a\nB\nc\n", "base.c", "source.c");
        assert_eq!(diff, "--- base.c\n+++ source.c\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n");
    }

    #[test]
    fn test_distant_changes_make_two_hunks() {
        let old: String = (0..20).map(|i| format!("line{}\n", i)).collect();
        let new = old.replace("line2\n", "changed2\n").replace("line17\n", "changed17\n");
        let diff = unified_diff(&old, &new, "a", "b");
        assert_eq!(diff.matches("@@ -").count(), 2);
        assert!(diff.contains("-line2\n+changed2\n"));
        assert!(diff.contains("-line17\n+changed17\n"));
    }
}
