use crate::util::Address;
use downcast_rs::{impl_downcast, Downcast};

/// What the heap needs to know about objects. The relocation engine copies and walks objects by
/// size, and never looks inside them otherwise.
pub trait ObjectModel: Downcast + Send + Sync {
    /// The class of the object at `object`.
    fn klass_of(&self, object: Address) -> Address;

    /// The size in words of `object`, given its class.
    fn size_given_klass(&self, klass: Address, object: Address) -> usize;

    /// The size in words of `object`.
    fn size_in_words(&self, object: Address) -> usize {
        self.size_given_klass(self.klass_of(object), object)
    }
}
impl_downcast!(ObjectModel);
