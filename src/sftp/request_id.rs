use super::wire::RequestId;

/// Hands out request IDs in increasing order, wrapping at `u32::MAX` and
/// skipping IDs that are still awaiting a response.
#[derive(Debug, Default)]
pub(crate) struct MonotonicRequestIdAllocator {
    next: RequestId,
}

impl MonotonicRequestIdAllocator {
    /// Returns `None` only when every ID is in flight.
    pub(crate) fn allocate<F>(&mut self, in_flight: F) -> Option<RequestId>
    where
        F: Fn(RequestId) -> bool,
    {
        let start = self.next;
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !in_flight(id) {
                return Some(id);
            }
            if self.next == start {
                return None;
            }
        }
    }
}
