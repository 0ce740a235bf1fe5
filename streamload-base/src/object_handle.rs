/// Identifies an object in the loader's object table. Handles are allocated starting at 1, so 0
/// never refers to a live object.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const fn null() -> Self {
        ObjectHandle(0)
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}
