//! Dynamic calls into C functions of a runtime-known signature.
//!
//! # Responsibility
//! - Call an entry address with up to `MAX_ARITY` marshalled words.
//!
//! # Invariants
//! - Each signature is a sequence of `Int`/`Float` word classes; every
//!   combination up to `MAX_ARITY` has a monomorphic call site below.
//! - Only 64-bit targets are supported: an integer word is exactly one
//!   general-purpose register or stack slot there.

use crate::binding::marshal::{NativeWord, RawReturn, WordClass};
use std::ffi::c_void;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("native function binding requires a 64-bit target");

/// Largest parameter count a bound function may declare.
pub const MAX_ARITY: usize = 6;

trait FromWord {
    fn from_word(word: Option<&NativeWord>) -> Self;
}

impl FromWord for i64 {
    fn from_word(word: Option<&NativeWord>) -> Self {
        match word {
            Some(NativeWord::Int(value)) => *value,
            _ => 0,
        }
    }
}

impl FromWord for f64 {
    fn from_word(word: Option<&NativeWord>) -> Self {
        match word {
            Some(NativeWord::Float(value)) => *value,
            _ => 0.0,
        }
    }
}

fn take_word<T: FromWord>(words: &mut std::slice::Iter<'_, NativeWord>) -> T {
    T::from_word(words.next())
}

macro_rules! word_type {
    (Int) => {
        i64
    };
    (Float) => {
        f64
    };
}

/// Expands to a match selecting the call site for the classes of `$words`.
macro_rules! dispatch {
    ($entry:ident, $words:ident, $ret:ty; $([$($class:ident)*])*) => {{
        let classes = $words.iter().map(|word| word.class()).collect::<Vec<_>>();
        match classes.as_slice() {
            $(
                [$(WordClass::$class),*] => {
                    let function = std::mem::transmute::<
                        *const c_void,
                        extern "C" fn($(word_type!($class)),*) -> $ret,
                    >($entry);
                    #[allow(unused_mut, unused_variables)]
                    let mut remaining = $words.iter();
                    Some(function($(take_word::<word_type!($class)>(&mut remaining)),*))
                }
            )*
            _ => None,
        }
    }};
}

/// Invokes `$callback!($args; <signatures>)` with every class sequence up to `MAX_ARITY`.
macro_rules! for_each_signature {
    ($callback:ident!($($args:tt)*)) => {
        $callback!($($args)*;
            []
            [Int] [Float]
            [Int Int] [Int Float] [Float Int] [Float Float]
            [Int Int Int] [Int Int Float] [Int Float Int] [Int Float Float] [Float Int Int]
            [Float Int Float] [Float Float Int] [Float Float Float]
            [Int Int Int Int] [Int Int Int Float] [Int Int Float Int] [Int Int Float Float]
            [Int Float Int Int] [Int Float Int Float] [Int Float Float Int]
            [Int Float Float Float] [Float Int Int Int] [Float Int Int Float]
            [Float Int Float Int] [Float Int Float Float] [Float Float Int Int]
            [Float Float Int Float] [Float Float Float Int] [Float Float Float Float]
            [Int Int Int Int Int] [Int Int Int Int Float] [Int Int Int Float Int]
            [Int Int Int Float Float] [Int Int Float Int Int] [Int Int Float Int Float]
            [Int Int Float Float Int] [Int Int Float Float Float] [Int Float Int Int Int]
            [Int Float Int Int Float] [Int Float Int Float Int] [Int Float Int Float Float]
            [Int Float Float Int Int] [Int Float Float Int Float] [Int Float Float Float Int]
            [Int Float Float Float Float] [Float Int Int Int Int] [Float Int Int Int Float]
            [Float Int Int Float Int] [Float Int Int Float Float] [Float Int Float Int Int]
            [Float Int Float Int Float] [Float Int Float Float Int]
            [Float Int Float Float Float] [Float Float Int Int Int] [Float Float Int Int Float]
            [Float Float Int Float Int] [Float Float Int Float Float]
            [Float Float Float Int Int] [Float Float Float Int Float]
            [Float Float Float Float Int] [Float Float Float Float Float]
            [Int Int Int Int Int Int] [Int Int Int Int Int Float] [Int Int Int Int Float Int]
            [Int Int Int Int Float Float] [Int Int Int Float Int Int]
            [Int Int Int Float Int Float] [Int Int Int Float Float Int]
            [Int Int Int Float Float Float] [Int Int Float Int Int Int]
            [Int Int Float Int Int Float] [Int Int Float Int Float Int]
            [Int Int Float Int Float Float] [Int Int Float Float Int Int]
            [Int Int Float Float Int Float] [Int Int Float Float Float Int]
            [Int Int Float Float Float Float] [Int Float Int Int Int Int]
            [Int Float Int Int Int Float] [Int Float Int Int Float Int]
            [Int Float Int Int Float Float] [Int Float Int Float Int Int]
            [Int Float Int Float Int Float] [Int Float Int Float Float Int]
            [Int Float Int Float Float Float] [Int Float Float Int Int Int]
            [Int Float Float Int Int Float] [Int Float Float Int Float Int]
            [Int Float Float Int Float Float] [Int Float Float Float Int Int]
            [Int Float Float Float Int Float] [Int Float Float Float Float Int]
            [Int Float Float Float Float Float] [Float Int Int Int Int Int]
            [Float Int Int Int Int Float] [Float Int Int Int Float Int]
            [Float Int Int Int Float Float] [Float Int Int Float Int Int]
            [Float Int Int Float Int Float] [Float Int Int Float Float Int]
            [Float Int Int Float Float Float] [Float Int Float Int Int Int]
            [Float Int Float Int Int Float] [Float Int Float Int Float Int]
            [Float Int Float Int Float Float] [Float Int Float Float Int Int]
            [Float Int Float Float Int Float] [Float Int Float Float Float Int]
            [Float Int Float Float Float Float] [Float Float Int Int Int Int]
            [Float Float Int Int Int Float] [Float Float Int Int Float Int]
            [Float Float Int Int Float Float] [Float Float Int Float Int Int]
            [Float Float Int Float Int Float] [Float Float Int Float Float Int]
            [Float Float Int Float Float Float] [Float Float Float Int Int Int]
            [Float Float Float Int Int Float] [Float Float Float Int Float Int]
            [Float Float Float Int Float Float] [Float Float Float Float Int Int]
            [Float Float Float Float Int Float] [Float Float Float Float Float Int]
            [Float Float Float Float Float Float]
        )
    };
}

/// # Safety
/// `entry` must be an `extern "C"` function taking one argument per word,
/// `long long`/pointer for `Int` and `double` for `Float`, returning an
/// integer, `bool` or pointer.
unsafe fn call_int(entry: *const c_void, words: &[NativeWord]) -> Option<i64> {
    for_each_signature!(dispatch!(entry, words, i64))
}

/// # Safety
/// As `call_int`, returning `double`.
unsafe fn call_float(entry: *const c_void, words: &[NativeWord]) -> Option<f64> {
    for_each_signature!(dispatch!(entry, words, f64))
}

/// # Safety
/// As `call_int`, returning `void`.
unsafe fn call_void(entry: *const c_void, words: &[NativeWord]) -> Option<()> {
    for_each_signature!(dispatch!(entry, words, ()))
}

/// Calls `entry` with `words`, reading the result register selected by `ret`.
///
/// Returns `None` when more than `MAX_ARITY` words are supplied.
///
/// # Safety
/// `entry` must be a live C function whose parameter list matches `words`
/// class-for-class and whose return class is `ret` (`None` for `void`).
pub unsafe fn invoke(
    entry: *const c_void,
    words: &[NativeWord],
    ret: Option<WordClass>,
) -> Option<RawReturn> {
    if words.len() > MAX_ARITY {
        return None;
    }
    unsafe {
        match ret {
            Some(WordClass::Int) => call_int(entry, words).map(RawReturn::Int),
            Some(WordClass::Float) => call_float(entry, words).map(RawReturn::Float),
            None => call_void(entry, words).map(|()| RawReturn::Void),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{invoke, MAX_ARITY};
    use crate::binding::marshal::{NativeWord, RawReturn, WordClass};
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicI64, Ordering};

    static LAST_TOUCH: AtomicI64 = AtomicI64::new(0);

    extern "C" fn add(a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn answer() -> i64 {
        42
    }

    extern "C" fn scale(value: f64, factor: i64) -> f64 {
        value * factor as f64
    }

    extern "C" fn weave(a: i64, b: f64, c: i64, d: f64, e: i64, f: f64) -> f64 {
        a as f64 + b * 10.0 + c as f64 * 100.0 + d * 1000.0 + e as f64 * 10000.0 + f * 100000.0
    }

    extern "C" fn touch(value: i64) {
        LAST_TOUCH.store(value, Ordering::SeqCst);
    }

    #[test]
    fn calls_integer_functions() {
        let raw = unsafe {
            invoke(
                add as *const c_void,
                &[NativeWord::Int(2), NativeWord::Int(3)],
                Some(WordClass::Int),
            )
        };
        let Some(RawReturn::Int(value)) = raw else {
            panic!("expected integer result, got {raw:?}");
        };
        assert_eq!(value as i32, 5);

        let raw = unsafe { invoke(answer as *const c_void, &[], Some(WordClass::Int)) };
        assert_eq!(raw, Some(RawReturn::Int(42)));
    }

    #[test]
    fn calls_mixed_class_functions() {
        let raw = unsafe {
            invoke(
                scale as *const c_void,
                &[NativeWord::Float(1.5), NativeWord::Int(4)],
                Some(WordClass::Float),
            )
        };
        assert_eq!(raw, Some(RawReturn::Float(6.0)));

        let words = [
            NativeWord::Int(1),
            NativeWord::Float(2.0),
            NativeWord::Int(3),
            NativeWord::Float(4.0),
            NativeWord::Int(5),
            NativeWord::Float(6.0),
        ];
        assert_eq!(words.len(), MAX_ARITY);
        let raw = unsafe { invoke(weave as *const c_void, &words, Some(WordClass::Float)) };
        assert_eq!(raw, Some(RawReturn::Float(654321.0)));
    }

    #[test]
    fn calls_void_functions() {
        let raw = unsafe { invoke(touch as *const c_void, &[NativeWord::Int(77)], None) };
        assert_eq!(raw, Some(RawReturn::Void));
        assert_eq!(LAST_TOUCH.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn rejects_too_many_words() {
        let words = [NativeWord::Int(0); MAX_ARITY + 1];
        let raw = unsafe { invoke(answer as *const c_void, &words, Some(WordClass::Int)) };
        assert_eq!(raw, None);
    }
}
