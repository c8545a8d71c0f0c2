use super::buffer::CodeBuffer;
use super::value_kind::ValueType;
use super::wat::push_float_text;

/// LEB128-encode an unsigned integer, low-order bytes first.
pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    let mut val = value;
    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;
        if val != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if val == 0 {
            break;
        }
    }
}

/// SLEB128-encode a signed 32-bit integer.
pub(crate) fn write_s32(buf: &mut Vec<u8>, value: i32) {
    write_s64(buf, i64::from(value));
}

/// SLEB128-encode a signed 64-bit integer.
pub(crate) fn write_s64(buf: &mut Vec<u8>, value: i64) {
    let mut val = value;
    loop {
        let byte = (val & 0x7F) as u8;
        let sign_bit = byte & 0x40;
        val >>= 7;
        let done = (val == 0 && sign_bit == 0) || (val == -1 && sign_bit != 0);
        buf.push(if done { byte } else { byte | 0x80 });
        if done {
            break;
        }
    }
}

/// Encoded length of a LEB128 unsigned integer, used by the
/// globalization cost model and the NOP rewriter.
pub(crate) fn leb_len_u32(value: u32) -> u32 {
    let mut len = 1;
    let mut val = value >> 7;
    while val != 0 {
        len += 1;
        val >>= 7;
    }
    len
}

/// Emit an opcode with no immediates.
pub(crate) fn encode_inst(code: &mut CodeBuffer, opcode: u8, name: &str) {
    if code.is_binary() {
        code.push_byte(opcode);
    } else {
        code.push_str(name);
        code.push_str("\n");
    }
}

/// Emit an opcode with one unsigned immediate. Structured-control
/// opcodes elide the immediate in text mode.
pub(crate) fn encode_u32_inst(code: &mut CodeBuffer, opcode: u8, name: &str, immediate: u32) {
    if code.is_binary() {
        code.push_byte(opcode);
        let mut tmp = Vec::new();
        write_u32(&mut tmp, immediate);
        code.extend_from_slice(&tmp);
    } else {
        match opcode {
            // block, loop, if carry a block type, not a printable value.
            0x02 | 0x03 | 0x04 => {
                code.push_str(name);
                code.push_str("\n");
            }
            _ => {
                code.push_str(&format!("{name} {immediate}\n"));
            }
        }
    }
}

/// Emit an opcode with one signed immediate.
pub(crate) fn encode_s32_inst(code: &mut CodeBuffer, opcode: u8, name: &str, immediate: i32) {
    if code.is_binary() {
        code.push_byte(opcode);
        let mut tmp = Vec::new();
        write_s32(&mut tmp, immediate);
        code.extend_from_slice(&tmp);
    } else {
        code.push_str(&format!("{name} {immediate}\n"));
    }
}

/// Emit an opcode with one signed 64-bit immediate (`i64.const`).
pub(crate) fn encode_s64_inst(code: &mut CodeBuffer, opcode: u8, name: &str, immediate: i64) {
    if code.is_binary() {
        code.push_byte(opcode);
        let mut tmp = Vec::new();
        write_s64(&mut tmp, immediate);
        code.extend_from_slice(&tmp);
    } else {
        code.push_str(&format!("{name} {immediate}\n"));
    }
}

fn is_memory_opcode(opcode: u8) -> bool {
    matches!(opcode, 0x28..=0x3E)
}

/// Emit an opcode with two unsigned immediates. Memory opcodes render as
/// `offset=`/`align=` annotations in text mode.
pub(crate) fn encode_u32_u32_inst(
    code: &mut CodeBuffer,
    opcode: u8,
    name: &str,
    first: u32,
    second: u32,
) {
    if code.is_binary() {
        code.push_byte(opcode);
        let mut tmp = Vec::new();
        write_u32(&mut tmp, first);
        write_u32(&mut tmp, second);
        code.extend_from_slice(&tmp);
    } else if is_memory_opcode(opcode) {
        // first is the alignment exponent, second the offset
        code.push_str(name);
        if second != 0 {
            code.push_str(&format!(" offset={second}"));
        }
        if first != 0 {
            code.push_str(&format!(" align={}", 1u32 << first));
        }
        code.push_str("\n");
    } else {
        code.push_str(&format!("{name} {first} {second}\n"));
    }
}

pub(crate) fn encode_f32_const(code: &mut CodeBuffer, value: f32) {
    if code.is_binary() {
        code.push_byte(0x43);
        code.extend_from_slice(&value.to_le_bytes());
    } else {
        code.push_str("f32.const ");
        push_float_text(code, f64::from(value));
        code.push_str("\n");
    }
}

pub(crate) fn encode_f64_const(code: &mut CodeBuffer, value: f64) {
    if code.is_binary() {
        code.push_byte(0x44);
        code.extend_from_slice(&value.to_le_bytes());
    } else {
        code.push_str("f64.const ");
        push_float_text(code, value);
        code.push_str("\n");
    }
}

/// Emit a `br_table` with its jump table and default depth.
pub(crate) fn encode_br_table(code: &mut CodeBuffer, table: &[u32], default_depth: u32) {
    if code.is_binary() {
        code.push_byte(0x0E);
        let mut tmp = Vec::new();
        write_u32(&mut tmp, table.len() as u32);
        for &depth in table {
            write_u32(&mut tmp, depth);
        }
        write_u32(&mut tmp, default_depth);
        code.extend_from_slice(&tmp);
    } else {
        code.push_str("br_table");
        for depth in table {
            code.push_str(&format!(" {depth}"));
        }
        code.push_str(&format!(" {default_depth}\n"));
    }
}

/// Emit a typed zero literal, used for synthetic returns and undef.
pub(crate) fn encode_literal_zero(code: &mut CodeBuffer, ty: ValueType) {
    match ty {
        ValueType::I32 => encode_s32_inst(code, 0x41, "i32.const", 0),
        ValueType::I64 => encode_s64_inst(code, 0x42, "i64.const", 0),
        ValueType::F32 => encode_f32_const(code, 0.0),
        ValueType::F64 => encode_f64_const(code, 0.0),
    }
}

/// Length-prefixed UTF-8 name, used by import/export/name sections.
pub(crate) fn push_name(buf: &mut Vec<u8>, name: &str) {
    write_u32(buf, name.len() as u32);
    buf.extend_from_slice(name.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutputMode;

    fn binary() -> CodeBuffer {
        CodeBuffer::new(OutputMode::Wasm)
    }

    fn text() -> CodeBuffer {
        CodeBuffer::new(OutputMode::Wast)
    }

    #[test]
    fn write_u32_encodes_multi_byte_values() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 0x3FFF);
        assert_eq!(buf, vec![0xFF, 0x7F]);
    }

    #[test]
    fn write_u32_single_byte_boundary() {
        let mut buf = Vec::new();
        write_u32(&mut buf, 127);
        assert_eq!(buf, vec![0x7F]);
        buf.clear();
        write_u32(&mut buf, 128);
        assert_eq!(buf, vec![0x80, 0x01]);
    }

    #[test]
    fn write_s32_encodes_negative_one_as_single_byte() {
        let mut buf = Vec::new();
        write_s32(&mut buf, -1);
        assert_eq!(buf, vec![0x7F]);
    }

    #[test]
    fn write_s32_sign_extension_stop_condition() {
        let mut buf = Vec::new();
        write_s32(&mut buf, -64);
        assert_eq!(buf, vec![0x40]);
        buf.clear();
        write_s32(&mut buf, -65);
        assert_eq!(buf, vec![0xBF, 0x7F]);
        buf.clear();
        write_s32(&mut buf, 64);
        assert_eq!(buf, vec![0xC0, 0x00]);
    }

    #[test]
    fn write_s64_round_trips_extremes() {
        let mut buf = Vec::new();
        write_s64(&mut buf, i64::MIN);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.last(), Some(&0x7F));
    }

    #[test]
    fn leb_len_matches_encoded_length() {
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut buf = Vec::new();
            write_u32(&mut buf, value);
            assert_eq!(leb_len_u32(value) as usize, buf.len(), "value {value}");
        }
    }

    #[test]
    fn encode_s32_inst_emits_opcode_and_sleb() {
        let mut code = binary();
        encode_s32_inst(&mut code, 0x41, "i32.const", -1);
        assert_eq!(code.bytes(), &[0x41, 0x7F]);
    }

    #[test]
    fn encode_u32_inst_elides_block_immediate_in_text() {
        let mut code = text();
        encode_u32_inst(&mut code, 0x02, "block", 0x40);
        assert_eq!(code.bytes(), b"block\n");
    }

    #[test]
    fn encode_memory_inst_text_prints_offset_and_align() {
        let mut code = text();
        encode_u32_u32_inst(&mut code, 0x28, "i32.load", 2, 24);
        assert_eq!(code.bytes(), b"i32.load offset=24 align=4\n");
    }

    #[test]
    fn encode_f64_const_writes_le_payload() {
        let mut code = binary();
        encode_f64_const(&mut code, -2.25);
        assert_eq!(code.bytes()[0], 0x44);
        assert_eq!(&code.bytes()[1..], &(-2.25f64).to_le_bytes());
    }

    #[test]
    fn encode_br_table_emits_entries_and_default() {
        let mut code = binary();
        encode_br_table(&mut code, &[0, 1, 2], 3);
        assert_eq!(code.bytes(), &[0x0E, 0x03, 0x00, 0x01, 0x02, 0x03]);
    }

    #[test]
    fn encode_literal_zero_uses_typed_opcodes() {
        let mut code = binary();
        encode_literal_zero(&mut code, ValueType::I32);
        encode_literal_zero(&mut code, ValueType::I64);
        assert_eq!(code.bytes(), &[0x41, 0x00, 0x42, 0x00]);
    }

    #[test]
    fn push_name_prefixes_length() {
        let mut buf = Vec::new();
        push_name(&mut buf, "wasm");
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[1..], b"wasm");
    }
}
