//! End-to-end translation: machine code written into process memory is
//! translated into the cache and executed there, producing the same
//! results as the native path would.

#![cfg(all(unix, target_arch = "x86_64"))]

use granary::{translate, Context, StackValidity};

/// Code bytes the translator will read out of our own address space,
/// padded so the decoder's lookahead window never leaves the allocation.
struct CodeBuf {
    bytes: Vec<u8>,
}

impl CodeBuf {
    fn new(code: &[u8]) -> CodeBuf {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut bytes = code.to_vec();
        bytes.extend_from_slice(&[0xCC; 16]);
        CodeBuf { bytes }
    }

    fn pc(&self) -> u64 {
        self.bytes.as_ptr() as u64
    }
}

#[test]
fn leaf_function_translates_and_runs() {
    // lea rax, [rdi + rsi]; ret
    let code = CodeBuf::new(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
    let ctx = Context::new();
    let cache_pc = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");

    let add: extern "C" fn(u64, u64) -> u64 = unsafe { core::mem::transmute(cache_pc as usize) };
    assert_eq!(add(2, 3), 5);
    assert_eq!(add(0, 0), 0);
    assert_eq!(add(u64::MAX, 1), 0);
}

#[test]
fn branches_take_both_paths() {
    // test rdi, rdi
    // jz .zero
    // mov rax, rdi
    // ret
    // .zero: mov rax, 42
    // ret
    let code = CodeBuf::new(&[
        0x48, 0x85, 0xFF, // test rdi, rdi
        0x74, 0x04, // jz +4
        0x48, 0x89, 0xF8, // mov rax, rdi
        0xC3, // ret
        0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, // mov rax, 42
        0xC3, // ret
    ]);
    let ctx = Context::new();
    let cache_pc = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");

    let f: extern "C" fn(u64) -> u64 = unsafe { core::mem::transmute(cache_pc as usize) };
    assert_eq!(f(7), 7);
    assert_eq!(f(0), 42);
    assert_eq!(f(123_456), 123_456);
}

#[test]
fn direct_calls_stay_inside_the_trace() {
    // f: call g; add rax, 1; ret
    // g: mov rax, 41; ret
    let code = CodeBuf::new(&[
        0xE8, 0x05, 0x00, 0x00, 0x00, // call +5 -> g
        0x48, 0x83, 0xC0, 0x01, // add rax, 1
        0xC3, // ret
        0x48, 0xC7, 0xC0, 0x29, 0x00, 0x00, 0x00, // g: mov rax, 41
        0xC3, // ret
    ]);
    let ctx = Context::new();
    let cache_pc = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");

    let f: extern "C" fn() -> u64 = unsafe { core::mem::transmute(cache_pc as usize) };
    assert_eq!(f(), 42);
}

#[test]
fn loops_iterate() {
    // xor rax, rax
    // .top: add rax, rdi
    // dec rsi
    // test rsi, rsi
    // jnz .top
    // ret
    let code = CodeBuf::new(&[
        0x48, 0x31, 0xC0, // xor rax, rax
        0x48, 0x01, 0xF8, // add rax, rdi
        0x48, 0xFF, 0xCE, // dec rsi
        0x48, 0x85, 0xF6, // test rsi, rsi
        0x75, 0xF5, // jnz -11 -> .top
        0xC3, // ret
    ]);
    let ctx = Context::new();
    let cache_pc = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");

    let mul: extern "C" fn(u64, u64) -> u64 = unsafe { core::mem::transmute(cache_pc as usize) };
    assert_eq!(mul(6, 7), 42);
    assert_eq!(mul(5, 1), 5);
}

#[test]
fn repeated_requests_dedupe_through_the_index() {
    let code = CodeBuf::new(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
    let ctx = Context::new();
    let first = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");
    let second = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");
    assert_eq!(first, second, "the second request hits the index");
}

#[test]
fn removed_ranges_translate_afresh() {
    let code = CodeBuf::new(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
    let ctx = Context::new();
    let first = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");

    let removed = ctx.index().remove_range(code.pc(), code.pc() + 0x10);
    assert!(!removed.is_empty());

    // Quiescence is trivially satisfied: nothing executes the old bytes.
    let second = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");
    assert_ne!(first, second, "the translation was rebuilt");
    let f: extern "C" fn(u64, u64) -> u64 = unsafe { core::mem::transmute(second as usize) };
    assert_eq!(f(20, 22), 42);
}

#[test]
fn indirect_entries_translate_with_caller_meta() {
    let code = CodeBuf::new(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
    let ctx = Context::new();
    let meta = ctx.allocate_meta(code.pc());
    let cache_pc = granary::translate_indirect(&ctx, meta).expect("translates");
    let add: extern "C" fn(u64, u64) -> u64 = unsafe { core::mem::transmute(cache_pc as usize) };
    assert_eq!(add(40, 2), 42);
}

#[test]
fn mismatched_stack_validity_adapts_to_the_cached_entry() {
    let code = CodeBuf::new(&[0x48, 0x8D, 0x04, 0x37, 0xC3]);
    let ctx = Context::new();
    let valid = translate(&ctx, code.pc(), StackValidity::Valid).expect("translates");
    let unknown = translate(&ctx, code.pc(), StackValidity::Unknown).expect("translates");
    assert_eq!(valid, unknown, "adapt re-keys against the cached entry");
}
