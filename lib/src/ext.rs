use itertools::Itertools;

/// Implements `priority_find` for collections.
pub trait PriorityFind<T> {
    /// Searches through a list of items using the provided prioritization function.
    /// Priorities are such that a lower number is higher priority, meaning that `0` is the highest possible priority.
    /// Items the function returns `None` for are not candidates at all.
    ///
    /// As the search is performed:
    /// - If a candidate with priority `0` is found, it is immediately returned and the rest of the search is aborted.
    /// - Otherwise, the first candidate with the best priority seen is retained until the end of the search.
    fn priority_find<P: Ord + Default, F: Fn(&T) -> Option<P>>(self, prioritize: F) -> Option<T>;
}

impl<T, I> PriorityFind<T> for I
where
    I: Iterator<Item = T>,
{
    fn priority_find<P: Ord + Default, F: Fn(&T) -> Option<P>>(self, prioritize: F) -> Option<T> {
        priority_find(self, prioritize)
    }
}

fn priority_find<T, P: Ord + Default, F: Fn(&T) -> Option<P>>(
    items: impl IntoIterator<Item = T>,
    prioritize: F,
) -> Option<T> {
    items
        .into_iter()
        .filter_map(|item| prioritize(&item).map(|priority| (priority, item)))
        // The default priority is the best one; nothing later can beat it.
        .take_while_inclusive(|(priority, _)| *priority != P::default())
        .fold(None, |result, (incoming, item)| match result {
            None => Some((incoming, item)),
            Some((current, _)) if incoming < current => Some((incoming, item)),
            Some(_) => result,
        })
        .map(|(_, item)| item)
}
