//! Cursor pagination for tag and catalog listings.
//!
//! Names are listed in lexicographic order. A page starts after the `last`
//! name seen by the client and holds at most `n` names; a full page carries a
//! cursor equal to its final name.

/// One page of names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Page {
    /// Names on this page, sorted.
    pub items: Vec<String>,
    /// Cursor for the next page, present when the page is full.
    pub next: Option<String>,
}

/// Take a page from `names`, which must already be sorted.
pub fn paginate<I>(names: I, n: Option<usize>, last: Option<&str>) -> Page
where
    I: IntoIterator<Item = String>,
{
    let after = names
        .into_iter()
        .filter(|name| last.is_none_or(|last| name.as_str() > last));

    let Some(n) = n else {
        return Page {
            items: after.collect(),
            next: None,
        };
    };

    let items: Vec<String> = after.take(n).collect();
    let next = if n > 0 && items.len() == n {
        items.last().cloned()
    } else {
        None
    };
    Page { items, next }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        ["alpha", "bravo", "charlie", "delta", "echo"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn pages_of_two() {
        let first = paginate(names(), Some(2), None);
        assert_eq!(first.items, vec!["alpha", "bravo"]);
        assert_eq!(first.next.as_deref(), Some("bravo"));

        let second = paginate(names(), Some(2), first.next.as_deref());
        assert_eq!(second.items, vec!["charlie", "delta"]);
        assert_eq!(second.next.as_deref(), Some("delta"));

        let third = paginate(names(), Some(2), second.next.as_deref());
        assert_eq!(third.items, vec!["echo"]);
        assert_eq!(third.next, None);
    }

    #[test]
    fn unbounded_and_empty_pages() {
        let all = paginate(names(), None, Some("charlie"));
        assert_eq!(all.items, vec!["delta", "echo"]);
        assert_eq!(all.next, None);

        let none = paginate(names(), Some(0), None);
        assert!(none.items.is_empty());
        assert_eq!(none.next, None);
    }
}
