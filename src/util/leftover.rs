use std::borrow::Borrow;
use std::hash::Hash;

use bytes::BytesMut;
use rustc_hash::FxHashMap;

/// Per-origin accumulator for bytes that did not (yet) form a complete frame.
///
/// Whoever decodes a stream owns one of these: a stream transport's run loop (keyed by sender),
///  or a [crate::transport::mux::MuxTransport] on behalf of all its children (keyed by child and
///  sender). It is only ever touched from that one task, so there is no locking.
#[derive(Debug)]
pub struct LeftoverBuffer<K = String> {
    pending: FxHashMap<K, BytesMut>,
}

impl<K> Default for LeftoverBuffer<K> {
    fn default() -> Self {
        LeftoverBuffer {
            pending: FxHashMap::default(),
        }
    }
}

impl<K: Hash + Eq> LeftoverBuffer<K> {
    pub fn new() -> LeftoverBuffer<K> {
        Default::default()
    }

    /// Prepends the bytes left over from `key`'s previous chunk to `data` and passes the result
    ///  to `consume`. Whatever `consume` returns is kept for the next call.
    pub fn feed<Q>(&mut self, key: &Q, data: &[u8], consume: impl FnOnce(&[u8]) -> Vec<u8>)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        let tail = match self.pending.remove(key) {
            Some(mut buf) => {
                buf.extend_from_slice(data);
                consume(&buf)
            }
            None => consume(data),
        };

        if !tail.is_empty() {
            self.pending.insert(key.to_owned(), BytesMut::from(tail.as_slice()));
        }
    }

    pub fn pending<Q>(&self, key: &Q) -> Option<&[u8]>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.pending.get(key).map(|b| b.as_ref())
    }

    /// Drops buffered bytes for one origin, e.g. when its connection went away
    pub fn discard<Q>(&mut self, key: &Q) -> Option<BytesMut>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.pending.remove(key)
    }

    /// Drops buffered bytes for all origins matching `pred`, returning the number of bytes dropped
    pub fn discard_matching(&mut self, pred: impl Fn(&K) -> bool) -> usize {
        let mut dropped = 0;
        self.pending.retain(|key, buf| {
            if pred(key) {
                dropped += buf.len();
                false
            }
            else {
                true
            }
        });
        dropped
    }
}
