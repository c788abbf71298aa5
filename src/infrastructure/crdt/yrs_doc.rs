use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

use crate::application::ports::crdt::{CrdtDoc, CrdtFactory};
use crate::domain::SyncError;

/// The single shared text root every replica agrees on.
const TEXT_ROOT: &str = "content";

/// yrs-backed CRDT adapter. The only module that names yrs types; everything
/// above sees opaque bytes through the `CrdtDoc`/`CrdtFactory` seam.
pub struct YrsFactory;

impl CrdtFactory for YrsFactory {
    fn create(&self) -> Box<dyn CrdtDoc> {
        Box::new(YrsDoc { doc: Doc::new() })
    }

    fn from_state(&self, state: &[u8]) -> Result<Box<dyn CrdtDoc>, SyncError> {
        let mut doc = YrsDoc { doc: Doc::new() };
        doc.apply_update(state)?;
        Ok(Box::new(doc))
    }
}

struct YrsDoc {
    doc: Doc,
}

impl CrdtDoc for YrsDoc {
    fn apply_update(&mut self, update: &[u8]) -> Result<(), SyncError> {
        let update = Update::decode_v1(update).map_err(|_| SyncError::MalformedUpdate)?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update).map_err(|_| SyncError::MalformedUpdate)
    }

    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn text(&self) -> String {
        let txt = self.doc.get_or_insert_text(TEXT_ROOT);
        let txn = self.doc.transact();
        txt.get_string(&txn)
    }

    fn replace_text(&mut self, text: &str) -> Vec<u8> {
        let txt = self.doc.get_or_insert_text(TEXT_ROOT);
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let len = txt.len(&txn);
            if len > 0 {
                txt.remove_range(&mut txn, 0, len);
            }
            if !text.is_empty() {
                txt.insert(&mut txn, 0, text);
            }
        }
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&before)
    }

    fn is_empty(&self) -> bool {
        let txt = self.doc.get_or_insert_text(TEXT_ROOT);
        let txn = self.doc.transact();
        txt.len(&txn) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_round_trips_through_update_bytes() {
        let factory = YrsFactory;
        let mut a = factory.create();
        let update = a.replace_text("print('hi')\n");

        let mut b = factory.create();
        b.apply_update(&update).unwrap();
        assert_eq!(b.text(), "print('hi')\n");
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn state_encoding_bootstraps_a_replica() {
        let factory = YrsFactory;
        let mut a = factory.create();
        a.replace_text("line one\n");
        a.replace_text("line one\nline two\n");

        let replica = factory.from_state(&a.encode_state()).unwrap();
        assert_eq!(replica.text(), "line one\nline two\n");
    }

    #[test]
    fn malformed_bytes_leave_state_untouched() {
        let factory = YrsFactory;
        let mut doc = factory.create();
        doc.replace_text("keep me");

        assert!(matches!(
            doc.apply_update(&[0xff, 0x00, 0x13, 0x37]),
            Err(SyncError::MalformedUpdate)
        ));
        assert_eq!(doc.text(), "keep me");
    }

    #[test]
    fn concurrent_updates_converge_regardless_of_order() {
        let factory = YrsFactory;
        let mut a = factory.create();
        a.replace_text("base\n");

        let mut b = factory.from_state(&a.encode_state()).unwrap();

        let from_a = a.replace_text("base\nfrom a\n");
        let from_b = b.replace_text("base\nfrom b\n");

        a.apply_update(&from_b).unwrap();
        b.apply_update(&from_a).unwrap();
        assert_eq!(a.text(), b.text());
    }

    #[test]
    fn empty_replace_clears_the_document() {
        let factory = YrsFactory;
        let mut doc = factory.create();
        doc.replace_text("something");
        assert!(!doc.is_empty());

        let update = doc.replace_text("");
        assert!(doc.is_empty());

        let mut other = factory.create();
        other.apply_update(&update).unwrap();
        assert!(other.text().is_empty());
    }
}
