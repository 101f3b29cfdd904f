//! Disassembly for block dumps and tests.

use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, NasmFormatter};

/// Decode `bytes` as 64-bit code placed at `ip`.
pub fn decode(bytes: &[u8], ip: u64) -> Vec<Instruction> {
    let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode());
    }
    out
}

/// One NASM-formatted line per instruction, prefixed with its address.
pub fn disassemble(bytes: &[u8], ip: u64) -> Vec<String> {
    let mut formatter = NasmFormatter::new();
    formatter.options_mut().set_branch_leading_zeros(false);
    formatter.options_mut().set_uppercase_hex(false);

    decode(bytes, ip)
        .iter()
        .map(|instr| {
            let mut text = String::new();
            formatter.format(instr, &mut text);
            format!("{:016x} {}", instr.ip(), text)
        })
        .collect()
}
