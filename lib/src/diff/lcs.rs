// Copyright 2024 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Longest-common-subsequence computation over token class ids.
//!
//! Myers' O(ND) algorithm in its divide-and-conquer form: forward and
//! reverse D-paths are walked simultaneously until they overlap, the
//! problem is split at the meeting point, and both halves recurse. Memory
//! stays linear in the input length regardless of edit distance.

/// A maximal run of tokens common to both sequences.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CommonRange {
    pub a: usize,
    pub b: usize,
    pub len: usize,
}

impl CommonRange {
    pub fn a_end(&self) -> usize {
        self.a + self.len
    }

    pub fn b_end(&self) -> usize {
        self.b + self.len
    }
}

/// Computes the common runs of `a` and `b`, ordered by position.
pub(crate) fn common_ranges(a: &[u32], b: &[u32]) -> Vec<CommonRange> {
    let mut raw = Vec::new();
    recurse(a, b, 0, 0, &mut raw);

    // Coalesce abutting runs produced on recursion boundaries.
    let mut merged: Vec<CommonRange> = Vec::with_capacity(raw.len());
    for range in raw {
        if let Some(last) = merged.last_mut()
            && last.a_end() == range.a
            && last.b_end() == range.b
        {
            last.len += range.len;
            continue;
        }
        merged.push(range);
    }
    merged
}

fn recurse(a: &[u32], b: &[u32], a_off: usize, b_off: usize, out: &mut Vec<CommonRange>) {
    // Common prefix.
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    if prefix > 0 {
        out.push(CommonRange {
            a: a_off,
            b: b_off,
            len: prefix,
        });
    }
    let (a, b) = (&a[prefix..], &b[prefix..]);
    let (a_off, b_off) = (a_off + prefix, b_off + prefix);

    // Common suffix.
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (a, a_tail) = a.split_at(a.len() - suffix);
    let (b, _) = b.split_at(b.len() - suffix);

    if !a.is_empty()
        && !b.is_empty()
        && let Some((x, y)) = middle_split(a, b)
    {
        recurse(&a[..x], &b[..y], a_off, b_off, out);
        recurse(&a[x..], &b[y..], a_off + x, b_off + y, out);
    }

    if suffix > 0 {
        out.push(CommonRange {
            a: a_off + a.len(),
            b: b_off + b.len(),
            len: a_tail.len(),
        });
    }
}

/// Finds a point on an optimal edit path by bisection, or `None` when the
/// inputs have no common subsequence at all. Both inputs are non-empty and
/// share no common prefix or suffix.
fn middle_split(a: &[u32], b: &[u32]) -> Option<(usize, usize)> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (a.len() + b.len()).div_ceil(2) as isize;
    let v_offset = max_d;
    let v_len = (2 * max_d + 2) as usize;
    let mut v1 = vec![-1isize; v_len];
    let mut v2 = vec![-1isize; v_len];
    v1[(v_offset + 1) as usize] = 0;
    v2[(v_offset + 1) as usize] = 0;
    let delta = n - m;
    // With an odd delta the paths can only meet while walking forward.
    let front = delta % 2 != 0;
    let mut k1start = 0;
    let mut k1end = 0;
    let mut k2start = 0;
    let mut k2end = 0;

    for d in 0..max_d {
        // Walk the forward path one step.
        let mut k1 = k1start - d;
        while k1 <= d - k1end {
            let k1_offset = (v_offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && v1[k1_offset - 1] < v1[k1_offset + 1]) {
                v1[k1_offset + 1]
            } else {
                v1[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 < m && x1 >= 0 && y1 >= 0 && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            v1[k1_offset] = x1;
            if x1 > n {
                // Ran off the right of the graph.
                k1end += 2;
            } else if y1 > m {
                // Ran off the bottom of the graph.
                k1start += 2;
            } else if front {
                let k2_offset = v_offset + delta - k1;
                if (0..v_len as isize).contains(&k2_offset) && v2[k2_offset as usize] != -1 {
                    let rx = v2[k2_offset as usize];
                    let ry = rx - (delta - k1);
                    // Only a reverse endpoint inside the grid counts.
                    if (0..=n).contains(&rx) && (0..=m).contains(&ry) && x1 >= n - rx {
                        return Some((x1 as usize, y1 as usize));
                    }
                }
            }
            k1 += 2;
        }

        // Walk the reverse path one step; v2 measures from the ends.
        let mut k2 = k2start - d;
        while k2 <= d - k2end {
            let k2_offset = (v_offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && v2[k2_offset - 1] < v2[k2_offset + 1]) {
                v2[k2_offset + 1]
            } else {
                v2[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n
                && y2 < m
                && x2 >= 0
                && y2 >= 0
                && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize]
            {
                x2 += 1;
                y2 += 1;
            }
            v2[k2_offset] = x2;
            if x2 > n {
                k2end += 2;
            } else if y2 > m {
                k2start += 2;
            } else if !front {
                let k1_offset = v_offset + delta - k2;
                if (0..v_len as isize).contains(&k1_offset) && v1[k1_offset as usize] != -1 {
                    let x1 = v1[k1_offset as usize];
                    let y1 = x1 - (delta - k2);
                    // Only a forward endpoint inside the grid counts.
                    if (0..=n).contains(&x1) && (0..=m).contains(&y1) && x1 >= n - x2 {
                        return Some((x1 as usize, y1 as usize));
                    }
                }
            }
            k2 += 2;
        }
    }
    // The paths never met inside the grid: the inputs share nothing.
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcs_len(a: &[u32], b: &[u32]) -> usize {
        common_ranges(a, b).iter().map(|r| r.len).sum()
    }

    /// Reference LCS length by dynamic programming.
    fn dp_lcs_len(a: &[u32], b: &[u32]) -> usize {
        let mut row = vec![0usize; b.len() + 1];
        for &x in a {
            let mut prev = 0;
            for (j, &y) in b.iter().enumerate() {
                let cur = row[j + 1];
                row[j + 1] = if x == y {
                    prev + 1
                } else {
                    row[j + 1].max(row[j])
                };
                prev = cur;
            }
        }
        row[b.len()]
    }

    fn check_invariants(a: &[u32], b: &[u32]) {
        let ranges = common_ranges(a, b);
        let mut last_a = 0;
        let mut last_b = 0;
        for range in &ranges {
            assert!(range.len > 0);
            assert!(range.a >= last_a && range.b >= last_b, "ranges must be ordered");
            assert_eq!(
                &a[range.a..range.a_end()],
                &b[range.b..range.b_end()],
                "ranges must cover equal content"
            );
            last_a = range.a_end();
            last_b = range.b_end();
        }
        assert_eq!(lcs_len(a, b), dp_lcs_len(a, b), "LCS must be maximal");
    }

    #[test]
    fn test_identical() {
        let a = [1, 2, 3, 4];
        assert_eq!(
            common_ranges(&a, &a),
            vec![CommonRange { a: 0, b: 0, len: 4 }]
        );
    }

    #[test]
    fn test_disjoint() {
        assert_eq!(common_ranges(&[1, 2], &[3, 4]), vec![]);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(common_ranges(&[], &[]), vec![]);
        assert_eq!(common_ranges(&[1], &[]), vec![]);
        assert_eq!(common_ranges(&[], &[1]), vec![]);
    }

    #[test]
    fn test_single_change() {
        // a b c / a B c
        let ranges = common_ranges(&[1, 2, 3], &[1, 9, 3]);
        assert_eq!(
            ranges,
            vec![
                CommonRange { a: 0, b: 0, len: 1 },
                CommonRange { a: 2, b: 2, len: 1 },
            ]
        );
    }

    #[test]
    fn test_insertion_and_deletion() {
        check_invariants(&[1, 2, 3, 4, 5], &[1, 3, 4, 6, 5]);
        check_invariants(&[1, 2, 3], &[4, 1, 2, 3]);
        check_invariants(&[1, 2, 3, 4], &[2, 4]);
    }

    #[test]
    fn test_repeated_tokens() {
        check_invariants(&[1, 1, 1, 2, 1, 1], &[1, 1, 2, 1, 1, 1]);
        check_invariants(&[5, 5, 5, 5], &[5, 5]);
    }

    #[test]
    fn test_pseudorandom_inputs() {
        // Deterministic pseudorandom sequences over a tiny alphabet (many
        // repeats, adversarial for LCS).
        let mut seed = 0x9e3779b9u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        for len in [10usize, 33, 64] {
            let a: Vec<u32> = (0..len).map(|_| next() % 4).collect();
            let b: Vec<u32> = (0..len + 7).map(|_| next() % 4).collect();
            check_invariants(&a, &b);
        }
    }
}
