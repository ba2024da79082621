/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_range() {
        let v: u16 = 65535usize.prechecked_cast();
        assert_eq!(v, u16::MAX);
        let v: u32 = 70000usize.prechecked_cast();
        assert_eq!(v, 70000);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }
}
