//! Shared assertions for decoder tests.

use crate::region::{Children, Region};

/// Checks bounds and compound spans for every region in the tree, including
/// lazily materialized children
pub(crate) fn assert_well_formed(regions: &[Region], buffer_len: usize) {
    for region in regions {
        check(region, buffer_len);
    }
}

fn check(region: &Region, buffer_len: usize) {
    assert!(
        region.start <= region.end && region.end <= buffer_len,
        "region '{}' [{}..{}) outside buffer of {} bytes",
        region.id,
        region.start,
        region.end,
        buffer_len
    );

    match &region.children {
        Children::None => {}
        Children::Eager(children) => {
            if let (Some(min), Some(max)) = (
                children.iter().map(|c| c.start).min(),
                children.iter().map(|c| c.end).max(),
            ) {
                assert_eq!(
                    (region.start, region.end),
                    (min, max),
                    "compound '{}' does not match its children",
                    region.id
                );
            }
            for child in children {
                check(child, buffer_len);
            }
        }
        Children::Lazy(lazy) => {
            for child in lazy.iter() {
                let child = child.expect("lazy child decodes");
                check(&child, buffer_len);
            }
        }
    }
}

/// Flattened `(depth, id, start, end, value)` listing of the eager tree
pub(crate) fn outline(regions: &[Region]) -> Vec<(usize, String, usize, usize, String)> {
    fn visit(r: &Region, depth: usize, out: &mut Vec<(usize, String, usize, usize, String)>) {
        out.push((depth, r.id.clone(), r.start, r.end, r.display_value()));
        for c in r.eager_children() {
            visit(c, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    for r in regions {
        visit(r, 0, &mut out);
    }
    out
}

/// Returns the top-level regions with the given id
pub(crate) fn find_all<'a>(regions: &'a [Region], id: &str) -> Vec<&'a Region> {
    regions.iter().filter(|r| r.id == id).collect()
}

/// Returns the first region with the given id anywhere in the eager tree
pub(crate) fn find_deep<'a>(regions: &'a [Region], id: &str) -> Option<&'a Region> {
    let mut found = None;
    for r in regions {
        r.walk(&mut |x| {
            if found.is_none() && x.id == id {
                found = Some(x);
            }
        });
        if found.is_some() {
            break;
        }
    }
    found
}
