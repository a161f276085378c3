use crate::jit::buffer::Buffer;
use crate::mem;

/// Assembler working storage: the code buffer, the label table with
/// forward-jump fixups, and the records for branches that target
/// bytecode IPs (resolved by the compiler once the IP map is complete).
pub struct MacroAssembler {
    code: Buffer,
    labels: Vec<Option<usize>>,
    jumps: Vec<ForwardJump>,
    ip_jumps: Vec<IpJump>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Label(usize);

impl Label {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct ForwardJump {
    at: usize,
    to: Label,
}

/// A branch displacement waiting for the bytecode-IP→machine-IP map.
#[derive(Copy, Clone, Debug)]
pub struct IpJump {
    pub target: u32,
    pub at: usize,
}

impl MacroAssembler {
    pub fn new() -> MacroAssembler {
        MacroAssembler {
            code: Buffer::new(1024),
            labels: Vec::new(),
            jumps: Vec::new(),
            ip_jumps: Vec::new(),
        }
    }

    pub fn pos(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, value: u8) {
        self.code.append_u8(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.append_u32(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.append_u64(value);
    }

    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.code.patch_u32(offset, value);
    }

    pub fn create_label(&mut self) -> Label {
        let idx = self.labels.len();
        self.labels.push(None);

        Label(idx)
    }

    pub fn bind_label(&mut self, lbl: Label) {
        let lbl_idx = lbl.index();

        assert!(self.labels[lbl_idx].is_none());
        self.labels[lbl_idx] = Some(self.pos());
    }

    /// Appends the 4-byte relative displacement for a label reference.
    /// Bound labels are resolved immediately, unbound ones get a
    /// placeholder and a fixup record.
    pub fn emit_label(&mut self, lbl: Label) {
        let value = self.labels[lbl.index()];

        match value {
            // backward jumps already know their target
            Some(idx) => {
                let current = self.pos() + 4;
                let target = idx;

                let diff = -((current - target) as i32);
                self.emit_u32(diff as u32);
            }

            // forward jumps do not know their target yet
            None => {
                let pos = self.pos();
                self.emit_u32(0);
                self.jumps.push(ForwardJump { at: pos, to: lbl });
            }
        }
    }

    /// Appends a placeholder displacement for a branch to a bytecode IP.
    pub fn emit_ip_displacement(&mut self, target: u32) {
        let pos = self.pos();
        self.emit_u32(0);
        self.ip_jumps.push(IpJump { target, at: pos });
    }

    pub fn ip_jumps(&self) -> &[IpJump] {
        &self.ip_jumps
    }

    pub fn fix_forward_jumps(&mut self) {
        for jmp in &self.jumps {
            let target = self.labels[jmp.to.0].expect("label not defined");
            let diff = (target - jmp.at - 4) as i32;

            self.code.patch_u32(jmp.at, diff as u32);
        }

        self.jumps.clear();
    }

    /// Finalizes label fixups and returns the emitted bytes.
    pub fn data(mut self) -> Vec<u8> {
        self.fix_forward_jumps();
        assert!(self.ip_jumps.is_empty(), "unresolved bytecode branches");

        self.code.into_vec()
    }

    /// Like `data`, but for callers that resolved IP branches themselves.
    pub fn finish(mut self) -> Vec<u8> {
        self.fix_forward_jumps();
        self.ip_jumps.clear();

        self.code.into_vec()
    }

    /// Pads with NOPs so that an immediate emitted `lead` bytes from now
    /// lands on a word boundary and can later be patched atomically.
    pub fn align_immediate(&mut self, lead: usize) {
        while (self.pos() + lead) % mem::ptr_width_usize() != 0 {
            self.emit_u8(0x90);
        }
    }
}

impl Default for MacroAssembler {
    fn default() -> MacroAssembler {
        MacroAssembler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label() {
        let mut masm = MacroAssembler::new();

        assert_eq!(Label(0), masm.create_label());
        assert_eq!(Label(1), masm.create_label());
    }

    #[test]
    fn test_backward() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();
        masm.bind_label(lbl);
        masm.emit_label(lbl);

        assert_eq!(vec![0xfc, 0xff, 0xff, 0xff], masm.data());
    }

    #[test]
    fn test_backward_with_gap() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();
        masm.bind_label(lbl);
        masm.emit_u8(0x33);
        masm.emit_label(lbl);

        assert_eq!(vec![0x33, 0xfb, 0xff, 0xff, 0xff], masm.data());
    }

    #[test]
    fn test_forward() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();
        masm.emit_label(lbl);
        masm.bind_label(lbl);

        assert_eq!(vec![0, 0, 0, 0], masm.data());
    }

    #[test]
    fn test_forward_with_gap() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();
        masm.emit_label(lbl);
        masm.emit_u8(0x11);
        masm.bind_label(lbl);

        assert_eq!(vec![1, 0, 0, 0, 0x11], masm.data());
    }

    #[test]
    #[should_panic]
    fn test_bind_label_twice() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();

        masm.bind_label(lbl);
        masm.bind_label(lbl);
    }

    #[test]
    #[should_panic]
    fn test_label_undefined() {
        let mut masm = MacroAssembler::new();
        let lbl = masm.create_label();

        masm.emit_label(lbl);
        masm.data();
    }

    #[test]
    fn test_align_immediate() {
        let mut masm = MacroAssembler::new();
        masm.emit_u8(0x90);
        masm.align_immediate(2);

        assert_eq!(0, (masm.pos() + 2) % mem::ptr_width_usize());
    }
}
