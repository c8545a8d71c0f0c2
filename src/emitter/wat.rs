use super::buffer::CodeBuffer;
use super::value_kind::type_string;
use crate::analysis::PointerKind;
use crate::ir::Signature;

/// Render a float literal the way the text format expects it.
pub(crate) fn push_float_text(code: &mut CodeBuffer, value: f64) {
    if value.is_nan() {
        code.push_str("nan");
    } else if value.is_infinite() {
        if value.is_sign_negative() {
            code.push_str("-");
        }
        code.push_str("inf");
    } else if value == value.trunc() && value.abs() < 1e15 {
        // Keep integral values unambiguous as floats.
        code.push_str(&format!("{value:.1}"));
    } else {
        code.push_str(&format!("{value}"));
    }
}

/// `(param ..) (result ..)` clauses for a function type.
pub(crate) fn signature_text(sig: &Signature) -> String {
    let mut out = String::new();
    if !sig.params.is_empty() {
        out.push_str(" (param");
        for param in &sig.params {
            out.push(' ');
            out.push_str(type_string(*param, PointerKind::ByteLayout));
        }
        out.push(')');
    }
    if sig.ret != crate::ir::IrType::Void {
        out.push_str(" (result ");
        out.push_str(type_string(sig.ret, PointerKind::ByteLayout));
        out.push(')');
    }
    out
}

/// Escape data-segment bytes for a `(data ...)` string literal.
pub(crate) fn escape_data_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for &byte in bytes {
        match byte {
            b' '..=b'~' if byte != b'"' && byte != b'\\' => out.push(byte as char),
            _ => out.push_str(&format!("\\{byte:02x}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{escape_data_bytes, push_float_text, signature_text};
    use crate::emitter::CodeBuffer;
    use crate::ir::{IrType, Signature};
    use crate::OutputMode;

    fn render(value: f64) -> String {
        let mut code = CodeBuffer::new(OutputMode::Wast);
        push_float_text(&mut code, value);
        String::from_utf8(code.bytes().to_vec()).unwrap()
    }

    #[test]
    fn float_text_keeps_integral_values_float_shaped() {
        assert_eq!(render(0.0), "0.0");
        assert_eq!(render(-3.0), "-3.0");
        assert_eq!(render(1.5), "1.5");
    }

    #[test]
    fn float_text_handles_non_finite_values() {
        assert_eq!(render(f64::INFINITY), "inf");
        assert_eq!(render(f64::NEG_INFINITY), "-inf");
        assert_eq!(render(f64::NAN), "nan");
    }

    #[test]
    fn signature_text_prints_params_and_result() {
        let sig = Signature::new(vec![IrType::I32, IrType::F64], IrType::F32);
        assert_eq!(signature_text(&sig), " (param i32 f64) (result f32)");
        let void = Signature::new(Vec::new(), IrType::Void);
        assert_eq!(signature_text(&void), "");
    }

    #[test]
    fn data_bytes_escape_non_printable_characters() {
        assert_eq!(escape_data_bytes(b"ab\x00\"\\"), "ab\\00\\22\\5c");
    }
}
