use quarry_codec::{
    ByteReader, CodecError,
    hash::{hash160, sha256},
};
use quarry_ledger::AtTimestamp;

use crate::{FunctionCode, OpCode, api::PlatformApi};

const USER_STACK_LIMIT: usize = 256;
const CALL_STACK_LIMIT: usize = 256;

/// The flags byte of the serialized machine state. Bit layout is
/// consensus-critical; unknown bits make a blob unreadable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MachineFlags(u8);

impl MachineFlags {
    pub const STOPPED: u8 = 1;
    pub const FINISHED: u8 = 1 << 1;
    pub const FROZEN: u8 = 1 << 2;
    pub const SLEEPING: u8 = 1 << 3;
    pub const FATAL: u8 = 1 << 4;

    const KNOWN: u8 = 0x1f;
    const SUSPENDED: u8 = Self::KNOWN;

    pub const fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::KNOWN != 0 {
            return None;
        }
        Some(Self(bits))
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub const fn insert(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub const fn remove(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

/// Result of a single platform-function evaluation.
enum Eval {
    Value(u64),
    Unit,
    /// End the round with the program counter unchanged, so the same
    /// instruction re-executes after the machine wakes.
    Suspend,
}

/// One AT's virtual machine.
///
/// The serialized form (`serialize`/`deserialize`, exact inverses) is the
/// consensus state blob. The user stack, call stack, and error-handler
/// address are round-scoped and never persisted; the A/B registers are
/// persisted but cleared on round entry unless the machine is resuming
/// from sleep.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    code: Vec<u8>,
    data: Vec<u8>,
    a: [u64; 4],
    b: [u64; 4],
    pc: u32,
    flags: MachineFlags,
    steps: u32,
    sleep_until_height: u32,
    previous_balance: u64,

    user_stack: Vec<u64>,
    call_stack: Vec<u32>,
    error_handler: Option<u32>,
    resumed_from_sleep: bool,
}

impl MachineState {
    /// A freshly deployed machine. The data segment length must be a
    /// multiple of the 8-byte word size.
    pub fn new(code: Vec<u8>, data: Vec<u8>) -> Result<Self, CodecError> {
        if data.len() % 8 != 0 {
            return Err(CodecError::LengthOutOfRange);
        }
        Ok(Self {
            code,
            data,
            a: [0; 4],
            b: [0; 4],
            pc: 0,
            flags: MachineFlags::default(),
            steps: 0,
            sleep_until_height: 0,
            previous_balance: 0,
            user_stack: Vec::new(),
            call_stack: Vec::new(),
            error_handler: None,
            resumed_from_sleep: false,
        })
    }

    /// Consensus layout, all integers little-endian:
    /// code_len u32 ‖ code ‖ data_len u32 ‖ data ‖ A[4] ‖ B[4] ‖ pc u32 ‖
    /// flags u8 ‖ steps u32 ‖ sleep_until_height u32 ‖ previous_balance u64.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.code.len() + self.data.len() + 85);
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code);
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
        for lane in self.a {
            out.extend_from_slice(&lane.to_le_bytes());
        }
        for lane in self.b {
            out.extend_from_slice(&lane.to_le_bytes());
        }
        out.extend_from_slice(&self.pc.to_le_bytes());
        out.push(self.flags.bits());
        out.extend_from_slice(&self.steps.to_le_bytes());
        out.extend_from_slice(&self.sleep_until_height.to_le_bytes());
        out.extend_from_slice(&self.previous_balance.to_le_bytes());
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let code_len = reader.u32()? as usize;
        let code = reader.take(code_len)?.to_vec();
        let data_len = reader.u32()? as usize;
        if data_len % 8 != 0 {
            return Err(CodecError::LengthOutOfRange);
        }
        let data = reader.take(data_len)?.to_vec();
        let mut a = [0u64; 4];
        for lane in &mut a {
            *lane = reader.u64()?;
        }
        let mut b = [0u64; 4];
        for lane in &mut b {
            *lane = reader.u64()?;
        }
        let pc = reader.u32()?;
        let flags = MachineFlags::from_bits(reader.u8()?).ok_or(CodecError::InvalidValue)?;
        let steps = reader.u32()?;
        let sleep_until_height = reader.u32()?;
        let previous_balance = reader.u64()?;
        reader.finish()?;
        Ok(Self {
            code,
            data,
            a,
            b,
            pc,
            flags,
            steps,
            sleep_until_height,
            previous_balance,
            user_stack: Vec::new(),
            call_stack: Vec::new(),
            error_handler: None,
            resumed_from_sleep: false,
        })
    }

    // ---- flags & round lifecycle ----

    pub const fn flags(&self) -> MachineFlags {
        self.flags
    }

    pub const fn is_stopped(&self) -> bool {
        self.flags.contains(MachineFlags::STOPPED)
    }

    pub const fn is_finished(&self) -> bool {
        self.flags.contains(MachineFlags::FINISHED)
    }

    pub const fn is_frozen(&self) -> bool {
        self.flags.contains(MachineFlags::FROZEN)
    }

    pub const fn is_sleeping(&self) -> bool {
        self.flags.contains(MachineFlags::SLEEPING)
    }

    pub const fn is_fatal(&self) -> bool {
        self.flags.contains(MachineFlags::FATAL)
    }

    const fn is_suspended(&self) -> bool {
        self.flags.0 & MachineFlags::SUSPENDED != 0
    }

    pub const fn set_fatal(&mut self) {
        self.flags.insert(MachineFlags::FATAL);
    }

    pub const fn set_frozen(&mut self) {
        self.flags.insert(MachineFlags::FROZEN);
    }

    pub const fn clear_frozen(&mut self) {
        self.flags.remove(MachineFlags::FROZEN);
    }

    pub const fn begin_sleep(&mut self, until_height: u32) {
        self.flags.insert(MachineFlags::SLEEPING);
        self.sleep_until_height = until_height;
    }

    pub const fn sleep_until_height(&self) -> u32 {
        self.sleep_until_height
    }

    pub const fn steps_used(&self) -> u32 {
        self.steps
    }

    pub const fn previous_balance(&self) -> u64 {
        self.previous_balance
    }

    pub const fn set_previous_balance(&mut self, balance: u64) {
        self.previous_balance = balance;
    }

    pub const fn resumed_from_sleep(&self) -> bool {
        self.resumed_from_sleep
    }

    /// Reset round-scoped state. Scratch registers survive only a
    /// sleep/wake boundary, where the program expects post-sleep data.
    pub fn prepare_round(&mut self, resumed_from_sleep: bool) {
        self.steps = 0;
        self.user_stack.clear();
        self.call_stack.clear();
        self.error_handler = None;
        self.resumed_from_sleep = resumed_from_sleep;
        if resumed_from_sleep {
            self.flags.remove(MachineFlags::SLEEPING);
            self.sleep_until_height = 0;
        } else {
            self.a = [0; 4];
            self.b = [0; 4];
        }
    }

    // ---- register access (used by the platform API) ----

    pub const fn a(&self) -> &[u64; 4] {
        &self.a
    }

    pub const fn b(&self) -> &[u64; 4] {
        &self.b
    }

    pub const fn zero_a(&mut self) {
        self.a = [0; 4];
    }

    pub const fn zero_b(&mut self) {
        self.b = [0; 4];
    }

    pub const fn set_a1(&mut self, value: u64) {
        self.a[0] = value;
    }

    /// Write a 24-byte fingerprint across lanes A2..A4, little-endian.
    pub fn set_a_fingerprint(&mut self, fingerprint: &[u8; 24]) {
        for (lane, chunk) in self.a[1..].iter_mut().zip(fingerprint.chunks_exact(8)) {
            *lane = u64::from_le_bytes(chunk.try_into().unwrap_or_else(|_| unreachable!()));
        }
    }

    pub fn a_fingerprint(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        for (chunk, lane) in out.chunks_exact_mut(8).zip(&self.a[1..]) {
            chunk.copy_from_slice(&lane.to_le_bytes());
        }
        out
    }

    pub fn a_bytes(&self) -> [u8; 32] {
        Self::lanes_to_bytes(&self.a)
    }

    pub fn b_bytes(&self) -> [u8; 32] {
        Self::lanes_to_bytes(&self.b)
    }

    pub fn set_b_bytes(&mut self, bytes: &[u8; 32]) {
        self.b = Self::bytes_to_lanes(bytes);
    }

    /// Zero B, then copy `prefix` into its leading bytes. Callers must
    /// ensure `prefix` fits; byte order is preserved lane-for-lane.
    pub fn set_b_prefix(&mut self, prefix: &[u8]) {
        let mut bytes = [0u8; 32];
        bytes[..prefix.len()].copy_from_slice(prefix);
        self.set_b_bytes(&bytes);
    }

    fn lanes_to_bytes(lanes: &[u64; 4]) -> [u8; 32] {
        let mut out = [0u8; 32];
        for (chunk, lane) in out.chunks_exact_mut(8).zip(lanes) {
            chunk.copy_from_slice(&lane.to_le_bytes());
        }
        out
    }

    fn bytes_to_lanes(bytes: &[u8; 32]) -> [u64; 4] {
        let mut lanes = [0u64; 4];
        for (lane, chunk) in lanes.iter_mut().zip(bytes.chunks_exact(8)) {
            *lane = u64::from_le_bytes(chunk.try_into().unwrap_or_else(|_| unreachable!()));
        }
        lanes
    }

    // ---- data segment ----

    const fn data_words(&self) -> u32 {
        (self.data.len() / 8) as u32
    }

    const fn valid_data_addr(&self, addr: u32) -> bool {
        addr < self.data_words()
    }

    fn get_data(&self, addr: u32) -> Option<u64> {
        let start = addr as usize * 8;
        self.data
            .get(start..start + 8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or_else(|_| unreachable!())))
    }

    fn set_data(&mut self, addr: u32, value: u64) -> bool {
        let start = addr as usize * 8;
        match self.data.get_mut(start..start + 8) {
            Some(chunk) => {
                chunk.copy_from_slice(&value.to_le_bytes());
                true
            }
            None => false,
        }
    }

    // ---- code fetch ----

    fn code_u8(&self, at: u32) -> u8 {
        self.code[at as usize]
    }

    fn code_u16(&self, at: u32) -> u16 {
        let start = at as usize;
        u16::from_le_bytes(
            self.code[start..start + 2]
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        )
    }

    fn code_u32(&self, at: u32) -> u32 {
        let start = at as usize;
        u32::from_le_bytes(
            self.code[start..start + 4]
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        )
    }

    fn code_u64(&self, at: u32) -> u64 {
        let start = at as usize;
        u64::from_le_bytes(
            self.code[start..start + 8]
                .try_into()
                .unwrap_or_else(|_| unreachable!()),
        )
    }

    // ---- execution ----

    /// A program-level error: divert to the error handler if one was
    /// installed this round, otherwise the round dies.
    fn program_error(&mut self) -> bool {
        match self.error_handler {
            Some(handler) if (handler as usize) < self.code.len() => {
                self.pc = handler;
                true
            }
            _ => {
                self.set_fatal();
                false
            }
        }
    }

    /// Run until suspension or until the step budget is exhausted.
    /// Exhaustion is fatal for the round.
    pub fn run(
        &mut self,
        api: &mut dyn PlatformApi,
        max_steps: u32,
        steps_per_function_call: u32,
    ) {
        loop {
            if self.is_suspended() {
                break;
            }
            let cost = self
                .code
                .get(self.pc as usize)
                .copied()
                .and_then(OpCode::from_repr)
                .map_or(1, |op| op.step_cost(steps_per_function_call));
            if self.steps.saturating_add(cost) > max_steps {
                self.set_fatal();
                break;
            }
            self.steps += cost;
            if !self.step(api) {
                break;
            }
        }
    }

    /// Execute one instruction. Returns whether execution may continue.
    pub fn step(&mut self, api: &mut dyn PlatformApi) -> bool {
        let pc = self.pc;
        let Some(op) = self
            .code
            .get(pc as usize)
            .copied()
            .and_then(OpCode::from_repr)
        else {
            return self.program_error();
        };
        if (pc as usize) + op.size() as usize > self.code.len() {
            return self.program_error();
        }
        let next = pc + op.size();

        match op {
            OpCode::Nop => self.advance(next),
            OpCode::SetVal => {
                let addr = self.code_u32(pc + 1);
                let value = self.code_u64(pc + 5);
                if !self.set_data(addr, value) {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::SetDat => self.binary_op(pc, next, |_, y| Some(y)),
            OpCode::ClrDat => self.unary_op(pc, next, |_| Some(0)),
            OpCode::IncDat => self.unary_op(pc, next, |v| Some(v.wrapping_add(1))),
            OpCode::DecDat => self.unary_op(pc, next, |v| Some(v.wrapping_sub(1))),
            OpCode::NotDat => self.unary_op(pc, next, |v| Some(!v)),
            OpCode::AddDat => self.binary_op(pc, next, |x, y| Some(x.wrapping_add(y))),
            OpCode::SubDat => self.binary_op(pc, next, |x, y| Some(x.wrapping_sub(y))),
            OpCode::MulDat => self.binary_op(pc, next, |x, y| Some(x.wrapping_mul(y))),
            OpCode::DivDat => self.binary_op(pc, next, |x, y| {
                (y != 0).then(|| (x as i64).wrapping_div(y as i64) as u64)
            }),
            OpCode::ModDat => self.binary_op(pc, next, |x, y| {
                (y != 0).then(|| (x as i64).wrapping_rem(y as i64) as u64)
            }),
            OpCode::BorDat => self.binary_op(pc, next, |x, y| Some(x | y)),
            OpCode::AndDat => self.binary_op(pc, next, |x, y| Some(x & y)),
            OpCode::XorDat => self.binary_op(pc, next, |x, y| Some(x ^ y)),
            OpCode::ShlDat => {
                self.binary_op(pc, next, |x, y| Some(if y >= 64 { 0 } else { x << y }))
            }
            OpCode::ShrDat => {
                self.binary_op(pc, next, |x, y| Some(if y >= 64 { 0 } else { x >> y }))
            }
            OpCode::SetInd => {
                let dest = self.code_u32(pc + 1);
                let Some(indirect) = self.code_addr_value(pc + 5) else {
                    return self.program_error();
                };
                let Some(value) = self.get_data(indirect as u32) else {
                    return self.program_error();
                };
                if indirect >= u64::from(self.data_words()) || !self.set_data(dest, value) {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::SetIdx => {
                let dest = self.code_u32(pc + 1);
                let Some(base) = self.code_addr_value(pc + 5) else {
                    return self.program_error();
                };
                let Some(index) = self.code_addr_value(pc + 9) else {
                    return self.program_error();
                };
                let Some(source) = base.checked_add(index).filter(|s| *s < u64::from(self.data_words()))
                else {
                    return self.program_error();
                };
                let value = self
                    .get_data(source as u32)
                    .unwrap_or_else(|| unreachable!());
                if !self.set_data(dest, value) {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::IndDat => {
                let Some(indirect) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                let Some(value) = self.code_addr_value(pc + 5) else {
                    return self.program_error();
                };
                if indirect >= u64::from(self.data_words()) || !self.set_data(indirect as u32, value)
                {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::IdxDat => {
                let Some(base) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                let Some(index) = self.code_addr_value(pc + 5) else {
                    return self.program_error();
                };
                let Some(value) = self.code_addr_value(pc + 9) else {
                    return self.program_error();
                };
                let Some(dest) = base.checked_add(index).filter(|d| *d < u64::from(self.data_words()))
                else {
                    return self.program_error();
                };
                if !self.set_data(dest as u32, value) {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::PshDat => {
                let Some(value) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                if self.user_stack.len() >= USER_STACK_LIMIT {
                    return self.program_error();
                }
                self.user_stack.push(value);
                self.advance(next)
            }
            OpCode::PopDat => {
                let addr = self.code_u32(pc + 1);
                let Some(value) = self.user_stack.pop() else {
                    return self.program_error();
                };
                if !self.set_data(addr, value) {
                    return self.program_error();
                }
                self.advance(next)
            }
            OpCode::JmpSub => {
                let target = self.code_u32(pc + 1);
                if (target as usize) >= self.code.len() || self.call_stack.len() >= CALL_STACK_LIMIT
                {
                    return self.program_error();
                }
                self.call_stack.push(next);
                self.pc = target;
                true
            }
            OpCode::RetSub => {
                let Some(target) = self.call_stack.pop() else {
                    return self.program_error();
                };
                self.pc = target;
                true
            }
            OpCode::JmpAdr => {
                let target = self.code_u32(pc + 1);
                if (target as usize) >= self.code.len() {
                    return self.program_error();
                }
                self.pc = target;
                true
            }
            OpCode::BzrDat => self.branch_unary(pc, next, |v| v == 0),
            OpCode::BnzDat => self.branch_unary(pc, next, |v| v != 0),
            OpCode::BgtDat => self.branch_binary(pc, next, |x, y| x > y),
            OpCode::BltDat => self.branch_binary(pc, next, |x, y| x < y),
            OpCode::BgeDat => self.branch_binary(pc, next, |x, y| x >= y),
            OpCode::BleDat => self.branch_binary(pc, next, |x, y| x <= y),
            OpCode::BeqDat => self.branch_binary(pc, next, |x, y| x == y),
            OpCode::BneDat => self.branch_binary(pc, next, |x, y| x != y),
            OpCode::SlpDat => {
                let Some(value) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                let target = AtTimestamp::from_packed(value).height();
                let current = api.current_block_height();
                self.pc = next;
                self.begin_sleep(target.max(current + 1));
                false
            }
            OpCode::SlpImd => {
                self.pc = next;
                self.begin_sleep(api.current_block_height() + 1);
                false
            }
            OpCode::FizDat => {
                let Some(value) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                if value == 0 {
                    self.pc = next;
                    self.flags.insert(MachineFlags::FINISHED);
                    return false;
                }
                self.advance(next)
            }
            OpCode::StzDat => {
                let Some(value) = self.code_addr_value(pc + 1) else {
                    return self.program_error();
                };
                if value == 0 {
                    self.pc = next;
                    self.flags.insert(MachineFlags::STOPPED);
                    return false;
                }
                self.advance(next)
            }
            OpCode::FinImd => {
                self.pc = next;
                self.flags.insert(MachineFlags::FINISHED);
                false
            }
            OpCode::StpImd => {
                self.pc = next;
                self.flags.insert(MachineFlags::STOPPED);
                false
            }
            OpCode::ErrAdr => {
                let handler = self.code_u32(pc + 1);
                if (handler as usize) >= self.code.len() {
                    return self.program_error();
                }
                self.error_handler = Some(handler);
                self.advance(next)
            }
            OpCode::ExtFun => {
                let code = self.code_u16(pc + 1);
                self.call_function(api, code, None, None, None, next)
            }
            OpCode::ExtFunDat => {
                let code = self.code_u16(pc + 1);
                let Some(arg) = self.code_addr_value(pc + 3) else {
                    return self.program_error();
                };
                self.call_function(api, code, None, Some(arg), None, next)
            }
            OpCode::ExtFunDat2 => {
                let code = self.code_u16(pc + 1);
                let Some(arg1) = self.code_addr_value(pc + 3) else {
                    return self.program_error();
                };
                let Some(arg2) = self.code_addr_value(pc + 7) else {
                    return self.program_error();
                };
                self.call_function(api, code, None, Some(arg1), Some(arg2), next)
            }
            OpCode::ExtFunRet => {
                let code = self.code_u16(pc + 1);
                let ret = self.code_u32(pc + 3);
                self.call_function(api, code, Some(ret), None, None, next)
            }
            OpCode::ExtFunRetDat => {
                let code = self.code_u16(pc + 1);
                let ret = self.code_u32(pc + 3);
                let Some(arg) = self.code_addr_value(pc + 7) else {
                    return self.program_error();
                };
                self.call_function(api, code, Some(ret), Some(arg), None, next)
            }
            OpCode::ExtFunRetDat2 => {
                let code = self.code_u16(pc + 1);
                let ret = self.code_u32(pc + 3);
                let Some(arg1) = self.code_addr_value(pc + 7) else {
                    return self.program_error();
                };
                let Some(arg2) = self.code_addr_value(pc + 11) else {
                    return self.program_error();
                };
                self.call_function(api, code, Some(ret), Some(arg1), Some(arg2), next)
            }
        }
    }

    fn advance(&mut self, next: u32) -> bool {
        self.pc = next;
        true
    }

    /// Read the data word addressed by the code operand at `at`.
    fn code_addr_value(&self, at: u32) -> Option<u64> {
        self.get_data(self.code_u32(at))
    }

    fn unary_op(&mut self, pc: u32, next: u32, f: impl FnOnce(u64) -> Option<u64>) -> bool {
        let addr = self.code_u32(pc + 1);
        let Some(value) = self.get_data(addr) else {
            return self.program_error();
        };
        let Some(result) = f(value) else {
            return self.program_error();
        };
        self.set_data(addr, result);
        self.advance(next)
    }

    fn binary_op(&mut self, pc: u32, next: u32, f: impl FnOnce(u64, u64) -> Option<u64>) -> bool {
        let dest = self.code_u32(pc + 1);
        let Some(lhs) = self.get_data(dest) else {
            return self.program_error();
        };
        let Some(rhs) = self.code_addr_value(pc + 5) else {
            return self.program_error();
        };
        let Some(result) = f(lhs, rhs) else {
            return self.program_error();
        };
        self.set_data(dest, result);
        self.advance(next)
    }

    fn branch_to(&mut self, pc: u32, offset: i8, next: u32, taken: bool) -> bool {
        if !taken {
            return self.advance(next);
        }
        let Some(target) = pc.checked_add_signed(i32::from(offset)) else {
            return self.program_error();
        };
        if (target as usize) >= self.code.len() {
            return self.program_error();
        }
        self.pc = target;
        true
    }

    fn branch_unary(&mut self, pc: u32, next: u32, cond: impl FnOnce(u64) -> bool) -> bool {
        let Some(value) = self.code_addr_value(pc + 1) else {
            return self.program_error();
        };
        let offset = self.code_u8(pc + 5) as i8;
        self.branch_to(pc, offset, next, cond(value))
    }

    fn branch_binary(&mut self, pc: u32, next: u32, cond: impl FnOnce(i64, i64) -> bool) -> bool {
        let Some(lhs) = self.code_addr_value(pc + 1) else {
            return self.program_error();
        };
        let Some(rhs) = self.code_addr_value(pc + 5) else {
            return self.program_error();
        };
        let offset = self.code_u8(pc + 9) as i8;
        self.branch_to(pc, offset, next, cond(lhs as i64, rhs as i64))
    }

    fn call_function(
        &mut self,
        api: &mut dyn PlatformApi,
        code: u16,
        ret_addr: Option<u32>,
        arg1: Option<u64>,
        arg2: Option<u64>,
        next: u32,
    ) -> bool {
        let Some(function) = FunctionCode::from_repr(code) else {
            return self.program_error();
        };
        if let Some(addr) = ret_addr {
            if !self.valid_data_addr(addr) {
                return self.program_error();
            }
        }
        let outcome = self.eval_function(api, function, arg1.unwrap_or(0), arg2.unwrap_or(0));
        if self.is_fatal() {
            return false;
        }
        match outcome {
            Eval::Suspend => false,
            Eval::Value(value) => {
                if let Some(addr) = ret_addr {
                    self.set_data(addr, value);
                }
                self.pc = next;
                !self.is_suspended()
            }
            Eval::Unit => {
                self.pc = next;
                !self.is_suspended()
            }
        }
    }

    #[allow(clippy::too_many_lines, reason = "one arm per platform function")]
    fn eval_function(
        &mut self,
        api: &mut dyn PlatformApi,
        function: FunctionCode,
        arg1: u64,
        arg2: u64,
    ) -> Eval {
        use FunctionCode as F;
        match function {
            F::GetA1 => Eval::Value(self.a[0]),
            F::GetA2 => Eval::Value(self.a[1]),
            F::GetA3 => Eval::Value(self.a[2]),
            F::GetA4 => Eval::Value(self.a[3]),
            F::GetB1 => Eval::Value(self.b[0]),
            F::GetB2 => Eval::Value(self.b[1]),
            F::GetB3 => Eval::Value(self.b[2]),
            F::GetB4 => Eval::Value(self.b[3]),
            F::SetA1 => {
                self.a[0] = arg1;
                Eval::Unit
            }
            F::SetA2 => {
                self.a[1] = arg1;
                Eval::Unit
            }
            F::SetA3 => {
                self.a[2] = arg1;
                Eval::Unit
            }
            F::SetA4 => {
                self.a[3] = arg1;
                Eval::Unit
            }
            F::SetA1A2 => {
                self.a[0] = arg1;
                self.a[1] = arg2;
                Eval::Unit
            }
            F::SetA3A4 => {
                self.a[2] = arg1;
                self.a[3] = arg2;
                Eval::Unit
            }
            F::SetB1 => {
                self.b[0] = arg1;
                Eval::Unit
            }
            F::SetB2 => {
                self.b[1] = arg1;
                Eval::Unit
            }
            F::SetB3 => {
                self.b[2] = arg1;
                Eval::Unit
            }
            F::SetB4 => {
                self.b[3] = arg1;
                Eval::Unit
            }
            F::SetB1B2 => {
                self.b[0] = arg1;
                self.b[1] = arg2;
                Eval::Unit
            }
            F::SetB3B4 => {
                self.b[2] = arg1;
                self.b[3] = arg2;
                Eval::Unit
            }
            F::ClearA => {
                self.zero_a();
                Eval::Unit
            }
            F::ClearB => {
                self.zero_b();
                Eval::Unit
            }
            F::ClearBoth => {
                self.zero_a();
                self.zero_b();
                Eval::Unit
            }
            F::CopyAFromB => {
                self.a = self.b;
                Eval::Unit
            }
            F::CopyBFromA => {
                self.b = self.a;
                Eval::Unit
            }
            F::CheckAIsZero => Eval::Value(u64::from(self.a == [0; 4])),
            F::CheckBIsZero => Eval::Value(u64::from(self.b == [0; 4])),
            F::CheckAEqualsB => Eval::Value(u64::from(self.a == self.b)),
            F::SwapAB => {
                core::mem::swap(&mut self.a, &mut self.b);
                Eval::Unit
            }
            F::OrAWithB => {
                for (a, b) in self.a.iter_mut().zip(self.b) {
                    *a |= b;
                }
                Eval::Unit
            }
            F::OrBWithA => {
                for (b, a) in self.b.iter_mut().zip(self.a) {
                    *b |= a;
                }
                Eval::Unit
            }
            F::AndAWithB => {
                for (a, b) in self.a.iter_mut().zip(self.b) {
                    *a &= b;
                }
                Eval::Unit
            }
            F::AndBWithA => {
                for (b, a) in self.b.iter_mut().zip(self.a) {
                    *b &= a;
                }
                Eval::Unit
            }
            F::XorAWithB => {
                for (a, b) in self.a.iter_mut().zip(self.b) {
                    *a ^= b;
                }
                Eval::Unit
            }
            F::XorBWithA => {
                for (b, a) in self.b.iter_mut().zip(self.a) {
                    *b ^= a;
                }
                Eval::Unit
            }
            F::Hash160AToB => {
                let digest = hash160(&self.a_bytes());
                self.set_b_prefix(&digest);
                Eval::Unit
            }
            F::CheckHash160AWithB => {
                let digest = hash160(&self.a_bytes());
                Eval::Value(u64::from(self.b_bytes()[..20] == digest))
            }
            F::Sha256AToB => {
                let digest = sha256(&self.a_bytes());
                self.set_b_bytes(&digest);
                Eval::Unit
            }
            F::CheckSha256AWithB => {
                let digest = sha256(&self.a_bytes());
                Eval::Value(u64::from(self.b_bytes() == digest))
            }
            F::GetBlockTimestamp => {
                Eval::Value(AtTimestamp::new(api.current_block_height(), 0).packed())
            }
            F::GetCreationTimestamp => {
                Eval::Value(AtTimestamp::new(api.at_creation_block_height(), 0).packed())
            }
            F::GetLastBlockTimestamp => Eval::Value(
                AtTimestamp::new(api.current_block_height().saturating_sub(1), 0).packed(),
            ),
            F::PutLastBlockHashInA => {
                api.put_previous_block_hash_into_a(self);
                Eval::Unit
            }
            F::ATxAfterTimestamp => {
                api.put_transaction_after_timestamp_into_a(AtTimestamp::from_packed(arg1), self);
                Eval::Unit
            }
            F::GetTypeForTxInA => Eval::Value(api.type_of_transaction_in_a(self)),
            F::GetAmountForTxInA => Eval::Value(api.amount_of_transaction_in_a(self)),
            F::GetTimestampForTxInA => Eval::Value(api.timestamp_of_transaction_in_a(self)),
            F::GetRandomIdForTxInA => match api.generate_random_using_transaction_in_a(self) {
                Some(value) => Eval::Value(value),
                None => Eval::Suspend,
            },
            F::MessageFromTxInAToB => {
                api.put_message_from_transaction_in_a_into_b(self);
                Eval::Unit
            }
            F::BToAddressOfTxInA => {
                api.put_address_from_transaction_in_a_into_b(self);
                Eval::Unit
            }
            F::BToAddressOfCreator => {
                api.put_creator_address_into_b(self);
                Eval::Unit
            }
            F::GetCurrentBalance => Eval::Value(api.current_balance()),
            F::GetPreviousBalance => Eval::Value(self.previous_balance),
            F::SendToAddressInB => {
                api.pay_amount_to_b(arg1, self);
                Eval::Unit
            }
            F::SendAllToAddressInB => {
                api.pay_all_to_b(self);
                Eval::Unit
            }
            F::SendOldToAddressInB => {
                api.pay_previous_to_b(self);
                Eval::Unit
            }
            F::SendAToAddressInB => {
                api.message_a_to_b(self);
                Eval::Unit
            }
            F::AddMinutesToTimestamp => Eval::Value(
                api.add_minutes_to_timestamp(AtTimestamp::from_packed(arg1), arg2)
                    .packed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PlatformApi;

    /// Minimal API double for machine-only tests.
    struct StubApi {
        height: u32,
    }

    impl PlatformApi for StubApi {
        fn current_block_height(&self) -> u32 {
            self.height
        }
        fn at_creation_block_height(&self) -> u32 {
            1
        }
        fn put_previous_block_hash_into_a(&mut self, _state: &mut MachineState) {}
        fn put_transaction_after_timestamp_into_a(
            &mut self,
            _timestamp: AtTimestamp,
            state: &mut MachineState,
        ) {
            state.zero_a();
        }
        fn type_of_transaction_in_a(&mut self, _state: &mut MachineState) -> u64 {
            u64::MAX
        }
        fn amount_of_transaction_in_a(&mut self, _state: &mut MachineState) -> u64 {
            0
        }
        fn timestamp_of_transaction_in_a(&mut self, _state: &mut MachineState) -> u64 {
            0
        }
        fn generate_random_using_transaction_in_a(
            &mut self,
            _state: &mut MachineState,
        ) -> Option<u64> {
            Some(4)
        }
        fn put_message_from_transaction_in_a_into_b(&mut self, _state: &mut MachineState) {}
        fn put_address_from_transaction_in_a_into_b(&mut self, _state: &mut MachineState) {}
        fn put_creator_address_into_b(&mut self, _state: &mut MachineState) {}
        fn current_balance(&self) -> u64 {
            0
        }
        fn pay_amount_to_b(&mut self, _amount: u64, _state: &MachineState) {}
        fn pay_all_to_b(&mut self, _state: &MachineState) {}
        fn pay_previous_to_b(&mut self, _state: &MachineState) {}
        fn message_a_to_b(&mut self, _state: &MachineState) {}
        fn add_minutes_to_timestamp(&self, timestamp: AtTimestamp, minutes: u64) -> AtTimestamp {
            timestamp.add_minutes(minutes, 1)
        }
        fn on_finished(&mut self, _amount: u64) {}
    }

    fn machine(code: Vec<u8>, words: usize) -> MachineState {
        MachineState::new(code, vec![0u8; words * 8]).unwrap()
    }

    #[test]
    fn serialization_round_trips() {
        let mut state = machine(vec![0x28], 4);
        state.set_a1(0x1122_3344_5566_7788);
        state.set_b_prefix(&[1, 2, 3]);
        state.begin_sleep(17);
        state.set_previous_balance(999);
        let blob = state.serialize();
        let restored = MachineState::deserialize(&blob).unwrap();
        assert_eq!(restored.serialize(), blob);
        assert_eq!(restored.a(), state.a());
        assert_eq!(restored.b(), state.b());
        assert_eq!(restored.sleep_until_height(), 17);
        assert_eq!(restored.previous_balance(), 999);
    }

    #[test]
    fn unknown_flag_bits_rejected() {
        let state = machine(vec![0x28], 1);
        let mut blob = state.serialize();
        // flags byte sits right after pc, with a 16-byte tail behind it
        let at = blob.len() - 17;
        blob[at] = 0x80;
        assert_eq!(
            MachineState::deserialize(&blob),
            Err(CodecError::InvalidValue)
        );
    }

    #[test]
    fn set_val_and_arithmetic() {
        // data[0] = 7; data[1] = 5; data[0] += data[1]; FIN
        let mut code = vec![0x01];
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&7u64.to_le_bytes());
        code.push(0x01);
        code.extend_from_slice(&1u32.to_le_bytes());
        code.extend_from_slice(&5u64.to_le_bytes());
        code.push(0x06);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(0x28);

        let mut state = machine(code, 2);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_finished());
        assert!(!state.is_fatal());
        assert_eq!(state.get_data(0), Some(12));
        assert_eq!(state.steps_used(), 4);
    }

    #[test]
    fn division_by_zero_is_fatal_without_handler() {
        // data[0] /= data[1] (both zero)
        let mut code = vec![0x09];
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        let mut state = machine(code, 2);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_fatal());
    }

    #[test]
    fn error_handler_diverts_program_errors() {
        // ERR_ADR <handler>; DIV by zero; ...; handler: FIN
        let mut code = vec![0x2b];
        code.extend_from_slice(&14u32.to_le_bytes());
        code.push(0x09);
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(0x28);
        let mut state = machine(code, 2);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_finished());
        assert!(!state.is_fatal());
    }

    #[test]
    fn illegal_opcode_is_fatal() {
        let mut state = machine(vec![0x19], 1);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_fatal());
    }

    #[test]
    fn out_of_bounds_data_address_is_fatal() {
        // CLR data[9] with only 2 words
        let mut code = vec![0x03];
        code.extend_from_slice(&9u32.to_le_bytes());
        let mut state = machine(code, 2);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_fatal());
    }

    #[test]
    fn step_budget_overrun_is_fatal() {
        // JMP 0 forever
        let mut code = vec![0x1a];
        code.extend_from_slice(&0u32.to_le_bytes());
        let mut state = machine(code, 1);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_fatal());
        assert_eq!(state.steps_used(), 100);
    }

    #[test]
    fn external_calls_cost_function_steps() {
        // EXT_FUN ClearA; FIN
        let mut code = vec![0x32];
        code.extend_from_slice(&0x0120u16.to_le_bytes());
        code.push(0x28);
        let mut state = machine(code, 1);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_finished());
        assert_eq!(state.steps_used(), 11);
    }

    #[test]
    fn register_functions_move_lanes() {
        // SET_VAL data[0]=odd value; EXT_FUN_DAT SetA1 data[0];
        // EXT_FUN CopyBFromA; EXT_FUN_RET GetB1 -> data[1]; FIN
        let mut code = vec![0x01];
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&0xdeadu64.to_le_bytes());
        code.push(0x33);
        code.extend_from_slice(&0x0110u16.to_le_bytes());
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(0x32);
        code.extend_from_slice(&0x0124u16.to_le_bytes());
        code.push(0x35);
        code.extend_from_slice(&0x0104u16.to_le_bytes());
        code.extend_from_slice(&1u32.to_le_bytes());
        code.push(0x28);

        let mut state = machine(code, 2);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_finished());
        assert_eq!(state.get_data(1), Some(0xdead));
    }

    #[test]
    fn sleep_opcode_suspends_and_resumes_past_height() {
        // SLP_IMD; FIN
        let mut state = machine(vec![0x2a, 0x28], 1);
        let mut api = StubApi { height: 5 };
        state.prepare_round(false);
        state.run(&mut api, 100, 10);
        assert!(state.is_sleeping());
        assert_eq!(state.sleep_until_height(), 6);

        let blob = state.serialize();
        let mut woken = MachineState::deserialize(&blob).unwrap();
        woken.prepare_round(true);
        let mut api = StubApi { height: 6 };
        woken.run(&mut api, 100, 10);
        assert!(woken.is_finished());
    }

    #[test]
    fn branches_take_signed_offsets() {
        // data[0] = 1; BNZ data[0] +7 jumps over an illegal opcode to FIN
        let mut code = vec![0x01];
        code.extend_from_slice(&0u32.to_le_bytes());
        code.extend_from_slice(&1u64.to_le_bytes());
        code.push(0x1e); // pc 13, next 19, target 13 + 7 = 20
        code.extend_from_slice(&0u32.to_le_bytes());
        code.push(7);
        code.push(0x19); // pc 19: illegal, reached only if not taken
        code.push(0x28); // pc 20: FIN
        let mut state = machine(code, 1);
        let mut api = StubApi { height: 5 };
        state.run(&mut api, 100, 10);
        assert!(state.is_finished());
        assert!(!state.is_fatal());
    }
}
