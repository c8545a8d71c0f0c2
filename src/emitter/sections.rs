use super::buffer::CodeBuffer;
use super::encoding::{push_name, write_u32};
use super::ensure_u32;
use crate::error::Result;
use crate::OutputMode;

/// A buffered module section.
///
/// The body accumulates into its own buffer; closing the section prefixes
/// the id and byte length so the driver can concatenate sections without
/// back-patching. Custom sections carry their name at the start of the
/// body. Text mode elides framing entirely.
#[derive(Debug)]
pub(crate) struct Section {
    id: u8,
    name: &'static str,
    payload: CodeBuffer,
}

impl Section {
    pub(crate) fn new(id: u8, name: &'static str, mode: OutputMode) -> Self {
        Self {
            id,
            name,
            payload: CodeBuffer::new(mode),
        }
    }

    pub(crate) fn body(&mut self) -> &mut CodeBuffer {
        &mut self.payload
    }

    #[cfg(test)]
    pub(crate) fn id(&self) -> u8 {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn payload_bytes(&self) -> &[u8] {
        self.payload.bytes()
    }

    pub(crate) fn encode_into(self, out: &mut Vec<u8>) -> Result<()> {
        if self.payload.mode() == OutputMode::Wast {
            out.extend_from_slice(self.payload.bytes());
            return Ok(());
        }
        out.push(self.id);
        let mut header = Vec::new();
        if self.id == 0 {
            push_name(&mut header, self.name);
        }
        let body = self.payload.into_bytes();
        let total = ensure_u32(
            header.len() + body.len(),
            "section payload exceeds WebAssembly limits",
        )?;
        write_u32(out, total);
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Section;
    use crate::OutputMode;

    #[test]
    fn encode_into_prefixes_id_and_length() {
        let mut section = Section::new(1, "Type", OutputMode::Wasm);
        section.body().extend_from_slice(&[0xAA, 0xBB]);
        assert_eq!(section.id(), 1);
        assert_eq!(section.payload_bytes(), &[0xAA, 0xBB]);
        let mut out = Vec::new();
        section.encode_into(&mut out).expect("encode section");
        assert_eq!(out, vec![0x01, 0x02, 0xAA, 0xBB]);
    }

    #[test]
    fn custom_section_writes_name_inside_body() {
        let mut section = Section::new(0, "name", OutputMode::Wasm);
        section.body().push_byte(0x07);
        let mut out = Vec::new();
        section.encode_into(&mut out).expect("encode section");
        // id 0, length covers name prefix + payload
        assert_eq!(out[0], 0x00);
        assert_eq!(out[1], 6);
        assert_eq!(&out[2..7], &[0x04, b'n', b'a', b'm', b'e']);
        assert_eq!(out[7], 0x07);
    }

    #[test]
    fn text_mode_elides_framing() {
        let mut section = Section::new(5, "Memory", OutputMode::Wast);
        section.body().push_str("(memory 1 2)\n");
        let mut out = Vec::new();
        section.encode_into(&mut out).expect("encode section");
        assert_eq!(out, b"(memory 1 2)\n");
    }
}
