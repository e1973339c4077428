//! Marshalling descriptors between script values and C ABI words.
//!
//! # Invariants
//! - Every argument travels as one 64-bit integer word or one `double` word.
//! - Narrow integer and `bool` results are truncated to their declared width
//!   before conversion, since the upper register bits are unspecified.

use crate::binding::value::{NativeHandle, ScriptValue};
use crate::binding::CallError;
use crate::manifest::SemanticType;
use std::ffi::{c_char, CStr, CString};

/// Register class one argument or return value occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordClass {
    Int,
    Float,
}

/// One marshalled argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeWord {
    Int(i64),
    Float(f64),
}

impl NativeWord {
    pub fn class(self) -> WordClass {
        match self {
            Self::Int(_) => WordClass::Int,
            Self::Float(_) => WordClass::Float,
        }
    }
}

/// How one parameter is converted before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgMarshal {
    /// `const char*`, NUL-terminated; `null` passes a null pointer.
    Str,
    /// C `int`.
    Int32,
    Int64,
    Double,
    /// C `bool`, passed as 0 or 1.
    Bool,
    /// Pointer-sized opaque value; `null` passes 0.
    Handle,
}

impl ArgMarshal {
    /// Descriptor for a parameter of type `ty`; `None` for `void`.
    pub fn for_type(ty: SemanticType) -> Option<Self> {
        match ty {
            SemanticType::Void => None,
            SemanticType::Bool => Some(Self::Bool),
            SemanticType::Int => Some(Self::Int32),
            SemanticType::Long => Some(Self::Int64),
            SemanticType::Double => Some(Self::Double),
            SemanticType::String => Some(Self::Str),
            SemanticType::Handle => Some(Self::Handle),
        }
    }

    pub fn class(self) -> WordClass {
        match self {
            Self::Double => WordClass::Float,
            Self::Str | Self::Int32 | Self::Int64 | Self::Bool | Self::Handle => WordClass::Int,
        }
    }

    pub fn semantic_type(self) -> SemanticType {
        match self {
            Self::Str => SemanticType::String,
            Self::Int32 => SemanticType::Int,
            Self::Int64 => SemanticType::Long,
            Self::Double => SemanticType::Double,
            Self::Bool => SemanticType::Bool,
            Self::Handle => SemanticType::Handle,
        }
    }
}

/// How the native result is converted back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMarshal {
    Void,
    Str,
    Int32,
    Int64,
    Double,
    Bool,
    Handle,
}

/// Raw result register selected by the return class.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawReturn {
    Void,
    Int(i64),
    Float(f64),
}

impl ReturnMarshal {
    pub fn for_type(ty: SemanticType) -> Self {
        match ty {
            SemanticType::Void => Self::Void,
            SemanticType::Bool => Self::Bool,
            SemanticType::Int => Self::Int32,
            SemanticType::Long => Self::Int64,
            SemanticType::Double => Self::Double,
            SemanticType::String => Self::Str,
            SemanticType::Handle => Self::Handle,
        }
    }

    /// `None` for `void`.
    pub fn class(self) -> Option<WordClass> {
        match self {
            Self::Void => None,
            Self::Double => Some(WordClass::Float),
            Self::Str | Self::Int32 | Self::Int64 | Self::Bool | Self::Handle => {
                Some(WordClass::Int)
            }
        }
    }
}

/// Converts one script argument into a native word.
///
/// `strings` keeps converted strings alive until the call returns.
pub fn marshal_arg(
    function: &str,
    param: &str,
    marshal: ArgMarshal,
    value: &ScriptValue,
    strings: &mut Vec<CString>,
) -> Result<NativeWord, CallError> {
    let mismatch = || CallError::TypeMismatch {
        function: function.to_string(),
        param: param.to_string(),
        expected: marshal.semantic_type(),
        got: value.type_name(),
    };

    match (marshal, value) {
        (ArgMarshal::Int32, ScriptValue::Int(v)) => {
            let narrowed = i32::try_from(*v).map_err(|_| CallError::IntegerOutOfRange {
                function: function.to_string(),
                param: param.to_string(),
                value: *v,
            })?;
            Ok(NativeWord::Int(narrowed.into()))
        }
        (ArgMarshal::Int64, ScriptValue::Int(v)) => Ok(NativeWord::Int(*v)),
        (ArgMarshal::Double, ScriptValue::Double(v)) => Ok(NativeWord::Float(*v)),
        (ArgMarshal::Double, ScriptValue::Int(v)) => Ok(NativeWord::Float(*v as f64)),
        (ArgMarshal::Bool, ScriptValue::Bool(v)) => Ok(NativeWord::Int(i64::from(*v))),
        (ArgMarshal::Str, ScriptValue::Null) | (ArgMarshal::Handle, ScriptValue::Null) => {
            Ok(NativeWord::Int(0))
        }
        (ArgMarshal::Str, ScriptValue::Str(text)) => {
            let owned = CString::new(text.as_str()).map_err(|_| CallError::InteriorNul {
                function: function.to_string(),
                param: param.to_string(),
            })?;
            let address = owned.as_ptr() as usize as i64;
            strings.push(owned);
            Ok(NativeWord::Int(address))
        }
        (ArgMarshal::Handle, ScriptValue::Handle(handle)) => Ok(NativeWord::Int(handle.0 as i64)),
        _ => Err(mismatch()),
    }
}

/// Converts the raw native result into a script value.
///
/// # Safety
/// For `ReturnMarshal::Str`, a non-null result must point to a NUL-terminated
/// string that stays valid for the duration of this call.
pub unsafe fn unmarshal_return(marshal: ReturnMarshal, raw: RawReturn) -> ScriptValue {
    match (marshal, raw) {
        (ReturnMarshal::Void, _) | (_, RawReturn::Void) => ScriptValue::Null,
        (ReturnMarshal::Double, RawReturn::Float(v)) => ScriptValue::Double(v),
        (ReturnMarshal::Int32, RawReturn::Int(v)) => ScriptValue::Int((v as i32).into()),
        (ReturnMarshal::Int64, RawReturn::Int(v)) => ScriptValue::Int(v),
        (ReturnMarshal::Bool, RawReturn::Int(v)) => ScriptValue::Bool(v as u8 != 0),
        (ReturnMarshal::Handle, RawReturn::Int(v)) => ScriptValue::Handle(NativeHandle(v as usize)),
        (ReturnMarshal::Str, RawReturn::Int(v)) => {
            let ptr = v as usize as *const c_char;
            if ptr.is_null() {
                ScriptValue::Null
            } else {
                // SAFETY: caller guarantees a valid NUL-terminated string.
                let text = unsafe { CStr::from_ptr(ptr) };
                ScriptValue::Str(text.to_string_lossy().into_owned())
            }
        }
        (_, RawReturn::Int(_)) | (_, RawReturn::Float(_)) => ScriptValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::{marshal_arg, unmarshal_return, ArgMarshal, NativeWord, RawReturn, ReturnMarshal};
    use crate::binding::value::{NativeHandle, ScriptValue};
    use crate::binding::CallError;
    use std::ffi::CStr;

    fn arg(marshal: ArgMarshal, value: ScriptValue) -> Result<NativeWord, CallError> {
        marshal_arg("f", "p", marshal, &value, &mut Vec::new())
    }

    #[test]
    fn int_parameters_are_range_checked() {
        assert_eq!(arg(ArgMarshal::Int32, ScriptValue::Int(-7)).unwrap(), NativeWord::Int(-7));
        let err = arg(ArgMarshal::Int32, ScriptValue::Int(1 << 40)).unwrap_err();
        assert!(matches!(err, CallError::IntegerOutOfRange { value, .. } if value == 1 << 40));
        assert_eq!(
            arg(ArgMarshal::Int64, ScriptValue::Int(1 << 40)).unwrap(),
            NativeWord::Int(1 << 40)
        );
    }

    #[test]
    fn ints_widen_to_double_but_not_the_reverse() {
        assert_eq!(
            arg(ArgMarshal::Double, ScriptValue::Int(3)).unwrap(),
            NativeWord::Float(3.0)
        );
        let err = arg(ArgMarshal::Int32, ScriptValue::Double(3.0)).unwrap_err();
        assert!(matches!(err, CallError::TypeMismatch { got: "double", .. }));
    }

    #[test]
    fn strings_stay_alive_in_storage() {
        let mut strings = Vec::new();
        let word = marshal_arg(
            "f",
            "p",
            ArgMarshal::Str,
            &ScriptValue::from("hello"),
            &mut strings,
        )
        .unwrap();
        let NativeWord::Int(address) = word else {
            panic!("strings travel as integer words");
        };
        assert_eq!(strings.len(), 1);
        let text = unsafe { CStr::from_ptr(address as usize as *const std::ffi::c_char) };
        assert_eq!(text.to_str().unwrap(), "hello");
    }

    #[test]
    fn interior_nul_is_rejected() {
        let err = arg(ArgMarshal::Str, ScriptValue::from("a\0b")).unwrap_err();
        assert!(matches!(err, CallError::InteriorNul { .. }));
    }

    #[test]
    fn null_passes_for_pointers_only() {
        assert_eq!(arg(ArgMarshal::Str, ScriptValue::Null).unwrap(), NativeWord::Int(0));
        assert_eq!(arg(ArgMarshal::Handle, ScriptValue::Null).unwrap(), NativeWord::Int(0));
        assert!(arg(ArgMarshal::Bool, ScriptValue::Null).is_err());
    }

    #[test]
    fn narrow_returns_are_truncated() {
        let garbage_high_bits = (0x1234_5678_i64 << 32) | 5;
        let int = unsafe { unmarshal_return(ReturnMarshal::Int32, RawReturn::Int(garbage_high_bits)) };
        assert_eq!(int, ScriptValue::Int(5));

        let flag = unsafe { unmarshal_return(ReturnMarshal::Bool, RawReturn::Int(0x100)) };
        assert_eq!(flag, ScriptValue::Bool(false));

        let handle = unsafe { unmarshal_return(ReturnMarshal::Handle, RawReturn::Int(0x1000)) };
        assert_eq!(handle, ScriptValue::Handle(NativeHandle(0x1000)));

        let null = unsafe { unmarshal_return(ReturnMarshal::Str, RawReturn::Int(0)) };
        assert_eq!(null, ScriptValue::Null);
    }
}
