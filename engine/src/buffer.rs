//! Typed views over caller-owned input and output arrays.

use std::ffi::c_void;

use veckern::DType;

use crate::value::Scalar;

/// A read-only typed slice.
#[derive(Debug, Clone, Copy)]
pub enum ArrayRef<'a> {
    Bool(&'a [bool]),
    I8(&'a [i8]),
    I16(&'a [i16]),
    I32(&'a [i32]),
    I64(&'a [i64]),
    U8(&'a [u8]),
    U16(&'a [u16]),
    U32(&'a [u32]),
    U64(&'a [u64]),
    F32(&'a [f32]),
    F64(&'a [f64]),
}

/// A writable typed slice.
#[derive(Debug)]
pub enum ArrayMut<'a> {
    Bool(&'a mut [bool]),
    I8(&'a mut [i8]),
    I16(&'a mut [i16]),
    I32(&'a mut [i32]),
    I64(&'a mut [i64]),
    U8(&'a mut [u8]),
    U16(&'a mut [u16]),
    U32(&'a mut [u32]),
    U64(&'a mut [u64]),
    F32(&'a mut [f32]),
    F64(&'a mut [f64]),
}

macro_rules! array_impls {
    ($($variant:ident($t:ty)),+ $(,)?) => {
        $(
            impl<'a> From<&'a [$t]> for ArrayRef<'a> {
                fn from(s: &'a [$t]) -> Self {
                    ArrayRef::$variant(s)
                }
            }

            impl<'a> From<&'a Vec<$t>> for ArrayRef<'a> {
                fn from(s: &'a Vec<$t>) -> Self {
                    ArrayRef::$variant(s.as_slice())
                }
            }

            impl<'a> From<&'a mut [$t]> for ArrayMut<'a> {
                fn from(s: &'a mut [$t]) -> Self {
                    ArrayMut::$variant(s)
                }
            }

            impl<'a> From<&'a mut Vec<$t>> for ArrayMut<'a> {
                fn from(s: &'a mut Vec<$t>) -> Self {
                    ArrayMut::$variant(s.as_mut_slice())
                }
            }
        )+

        impl ArrayRef<'_> {
            pub fn dtype(&self) -> DType {
                match self {
                    $(ArrayRef::$variant(_) => DType::$variant,)+
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(ArrayRef::$variant(s) => s.len(),)+
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn as_ptr(&self) -> *const c_void {
                match self {
                    $(ArrayRef::$variant(s) => s.as_ptr().cast(),)+
                }
            }

            /// Element `i`; panics if out of bounds.
            pub fn get(&self, i: usize) -> Scalar {
                match self {
                    $(ArrayRef::$variant(s) => Scalar::$variant(s[i]),)+
                }
            }
        }

        impl ArrayMut<'_> {
            pub fn dtype(&self) -> DType {
                match self {
                    $(ArrayMut::$variant(_) => DType::$variant,)+
                }
            }

            pub fn len(&self) -> usize {
                match self {
                    $(ArrayMut::$variant(s) => s.len(),)+
                }
            }

            pub fn is_empty(&self) -> bool {
                self.len() == 0
            }

            pub fn as_mut_ptr(&mut self) -> *mut c_void {
                match self {
                    $(ArrayMut::$variant(s) => s.as_mut_ptr().cast(),)+
                }
            }

            /// Store `value` at `i`, converting it to the array's dtype.
            pub fn set(&mut self, i: usize, value: Scalar) {
                let dtype = self.dtype();
                match (self, value.cast(dtype)) {
                    $((ArrayMut::$variant(s), Scalar::$variant(v)) => s[i] = v,)+
                    _ => {}
                }
            }
        }
    };
}

array_impls!(
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_and_len() {
        let data = [1.0f32, 2.0];
        let a = ArrayRef::from(&data[..]);
        assert_eq!(a.dtype(), DType::F32);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get(1), Scalar::F32(2.0));
    }

    #[test]
    fn test_set_converts() {
        let mut out = vec![0i32; 2];
        let mut m = ArrayMut::from(&mut out);
        m.set(0, Scalar::F64(2.9));
        m.set(1, Scalar::Bool(true));
        assert_eq!(out, vec![2, 1]);
    }
}
