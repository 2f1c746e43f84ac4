use log::debug;
use log::error;
use log::trace;

use crate::cpu::reg;
use crate::cpu::Clock;
use crate::cpu::CpuError;
use crate::cpu::History;
use crate::cpu::Registers;
use crate::cpu::CPU;
use crate::mem::Memory;

impl Clock {
  pub fn new() -> Clock {
    Clock { m: 0, t: 0 }
  }
}

impl CPU {
  pub fn new() -> CPU {
    CPU {
      regs: Registers::new(),
      clock: Clock::new(),
      history: History::new(),
      ime: true,
      halt: false,
      stop: false,
    }
  }

  /// Restore the post-boot register file, clear the latches, and zero the
  /// clock totals. IME comes back enabled, matching real post-boot state.
  pub fn reset(&mut self) {
    self.regs = Registers::new();
    self.clock = Clock::new();
    self.history.clear();
    self.ime = true;
    self.halt = false;
    self.stop = false;
  }

  pub fn regs(&self) -> &Registers {
    &self.regs
  }

  pub fn clock(&self) -> &Clock {
    &self.clock
  }

  pub fn history(&self) -> &History {
    &self.history
  }

  pub fn ime(&self) -> bool {
    self.ime
  }

  pub fn halted(&self) -> bool {
    self.halt
  }

  pub fn stopped(&self) -> bool {
    self.stop
  }

  pub fn halted_or_stopped(&self) -> bool {
    self.halt || self.stop
  }

  /// Run one instruction.
  /// Update the per-instruction m/t cost and fold it into the running totals.
  /// Return t, the time taken for this instruction.
  ///
  /// A halted or stopped core does not fetch; it idles in 1 M-cycle units so
  /// a host that keeps calling `step` still sees time advance.
  pub fn step<M: Memory>(&mut self, mem: &mut M) -> Result<u32, CpuError> {
    if self.halt || self.stop {
      self.regs.set_cost(1);
      self.clock.m += 1;
      self.clock.t += 4;
      return Ok(self.regs.t());
    }
    self.history.record(&self.regs);
    let m = self.exec(mem)?;
    self.regs.set_cost(m);
    self.clock.m += u64::from(m);
    self.clock.t += u64::from(4 * m);
    Ok(self.regs.t())
  }

  /// Run instructions until the core halts or stops, or an illegal opcode
  /// surfaces. `step` is the single-instruction form of this loop.
  pub fn execute<M: Memory>(&mut self, mem: &mut M) -> Result<(), CpuError> {
    while !self.halt && !self.stop {
      self.step(mem)?;
    }
    Ok(())
  }

  /// Deliver an interrupt: clear IME and the halt latch, push PC, and enter
  /// the service routine at `vector` (0x40/0x48/0x50/0x58/0x60). The host's
  /// interrupt controller decides when to call this. Returns the t cost.
  pub fn handle_interrupt<M: Memory>(&mut self, mem: &mut M, vector: u16) -> u32 {
    debug!("interrupt to {:#04x}, pushing pc {:#06x}", vector, self.regs.pc);
    self.ime = false;
    self.halt = false;
    self.regs.sp = self.regs.sp.wrapping_sub(2);
    mem.ww(self.regs.sp, self.regs.pc);
    self.regs.pc = vector;
    self.regs.set_cost(5);
    self.clock.m += 5;
    self.clock.t += 20;
    self.regs.t()
  }

  /// Execute the next opcode.
  /// Return the m-time taken to run that opcode.
  fn exec<M: Memory>(&mut self, mem: &mut M) -> Result<u32, CpuError> {
    let start = self.regs.pc;

    macro_rules! fetch8 {
      () => {{
        let result = mem.rb(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        result
      }}
    }
    macro_rules! fetch16 {
      () => {{
        let lo = fetch8!();
        let hi = fetch8!();
        u16::from(lo) | (u16::from(hi) << 8)
      }}
    }
    macro_rules! illegal {
      ($byte:expr) => {{
        self.stop = true;
        error!("illegal opcode {:#04x} at {:#06x}", $byte, start);
        return Err(CpuError::IllegalOpcode {
          address: start,
          byte: $byte,
        });
      }}
    }

    macro_rules! ld_r_n {
      ($r:ident) => {{
        self.regs.$r = fetch8!();
        2
      }}
    }
    macro_rules! ld_rr_nn {
      ($hi:ident, $lo:ident) => {{
        self.regs.$lo = fetch8!();
        self.regs.$hi = fetch8!();
        3
      }}
    }
    macro_rules! ld_r_r {
      ($dst:ident, $src:ident) => {{
        self.regs.$dst = self.regs.$src;
        1
      }}
    }
    macro_rules! ld_r_rrm {
      ($dst:ident, $pair:ident) => {{
        self.regs.$dst = mem.rb(self.regs.$pair());
        2
      }}
    }
    macro_rules! ld_rrm_r {
      ($pair:ident, $src:ident) => {{
        mem.wb(self.regs.$pair(), self.regs.$src);
        2
      }}
    }

    macro_rules! push {
      ($hi:ident, $lo:ident) => {{
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        mem.wb(self.regs.sp, self.regs.$hi);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        mem.wb(self.regs.sp, self.regs.$lo);
        4
      }}
    }
    macro_rules! pop {
      ($hi:ident, $lo:ident) => {{
        self.regs.$lo = mem.rb(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        self.regs.$hi = mem.rb(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(1);
        3
      }}
    }

    macro_rules! add_a {
      ($n:expr) => {{
        let a = self.regs.a;
        let n = $n;
        let result = a.wrapping_add(n);
        self.regs.a = result;
        self.regs.set_zn(result, false);
        if (a & 0xf) + (n & 0xf) > 0xf {
          self.regs.f |= reg::H;
        }
        if u16::from(a) + u16::from(n) > 0xff {
          self.regs.f |= reg::C;
        }
        1
      }}
    }
    macro_rules! adc_a {
      ($n:expr) => {{
        let a = self.regs.a;
        let n = $n;
        let c = if self.regs.c() { 1 } else { 0 };
        let result = a.wrapping_add(n).wrapping_add(c);
        self.regs.a = result;
        self.regs.set_zn(result, false);
        if (a & 0xf) + (n & 0xf) + c > 0xf {
          self.regs.f |= reg::H;
        }
        if u16::from(a) + u16::from(n) + u16::from(c) > 0xff {
          self.regs.f |= reg::C;
        }
        1
      }}
    }
    macro_rules! sub_a {
      ($n:expr) => {{
        let a = self.regs.a;
        let n = $n;
        let result = a.wrapping_sub(n);
        self.regs.a = result;
        self.regs.set_zn(result, true);
        if (a & 0xf) < (n & 0xf) {
          self.regs.f |= reg::H;
        }
        if a < n {
          self.regs.f |= reg::C;
        }
        1
      }}
    }
    macro_rules! sbc_a {
      ($n:expr) => {{
        let a = self.regs.a;
        let n = $n;
        let c = if self.regs.c() { 1 } else { 0 };
        let result = a.wrapping_sub(n).wrapping_sub(c);
        self.regs.a = result;
        self.regs.set_zn(result, true);
        if (a & 0xf) < (n & 0xf) + c {
          self.regs.f |= reg::H;
        }
        if u16::from(a) < u16::from(n) + u16::from(c) {
          self.regs.f |= reg::C;
        }
        1
      }}
    }
    macro_rules! and_a {
      ($n:expr) => {{
        self.regs.a &= $n;
        let result = self.regs.a;
        self.regs.set_zn(result, false);
        self.regs.f |= reg::H;
        1
      }}
    }
    macro_rules! xor_a {
      ($n:expr) => {{
        self.regs.a ^= $n;
        let result = self.regs.a;
        self.regs.set_zn(result, false);
        1
      }}
    }
    macro_rules! or_a {
      ($n:expr) => {{
        self.regs.a |= $n;
        let result = self.regs.a;
        self.regs.set_zn(result, false);
        1
      }}
    }
    macro_rules! cp_a {
      ($n:expr) => {{
        let a = self.regs.a;
        let n = $n;
        self.regs.set_zn(a.wrapping_sub(n), true);
        if (a & 0xf) < (n & 0xf) {
          self.regs.f |= reg::H;
        }
        if a < n {
          self.regs.f |= reg::C;
        }
        1
      }}
    }

    macro_rules! inc8 {
      ($r:expr) => {{
        let n = $r;
        let result = n.wrapping_add(1);
        $r = result;
        let carry = self.regs.f & reg::C;
        self.regs.set_zn(result, false);
        if n & 0xf == 0xf {
          self.regs.f |= reg::H;
        }
        // C is untouched by 8-bit INC.
        self.regs.f |= carry;
        1
      }}
    }
    macro_rules! dec8 {
      ($r:expr) => {{
        let n = $r;
        let result = n.wrapping_sub(1);
        $r = result;
        let carry = self.regs.f & reg::C;
        self.regs.set_zn(result, true);
        if n & 0xf == 0 {
          self.regs.f |= reg::H;
        }
        // C is untouched by 8-bit DEC.
        self.regs.f |= carry;
        1
      }}
    }

    macro_rules! inc16 {
      ($hi:ident, $lo:ident) => {{
        let hi = u16::from(self.regs.$hi);
        let lo = u16::from(self.regs.$lo);
        let n = ((hi << 8) | lo).wrapping_add(1);
        self.regs.$hi = (n >> 8) as u8;
        self.regs.$lo = (n & 0xff) as u8;
        2
      }}
    }
    macro_rules! dec16 {
      ($hi:ident, $lo:ident) => {{
        let hi = u16::from(self.regs.$hi);
        let lo = u16::from(self.regs.$lo);
        let n = ((hi << 8) | lo).wrapping_sub(1);
        self.regs.$hi = (n >> 8) as u8;
        self.regs.$lo = (n & 0xff) as u8;
        2
      }}
    }

    macro_rules! add_hl {
      ($n:expr) => {{
        let hl = self.regs.hl();
        let n = $n;
        let result = hl.wrapping_add(n);
        // Z survives; N clears; H/C from bits 11 and 15.
        self.regs.f &= reg::Z;
        if (hl & 0xfff) + (n & 0xfff) > 0xfff {
          self.regs.f |= reg::H;
        }
        if u32::from(hl) + u32::from(n) > 0xffff {
          self.regs.f |= reg::C;
        }
        self.regs.set_hl(result);
        2
      }}
    }

    macro_rules! jp {
      () => {{
        self.regs.pc = fetch16!();
        4
      }}
    }
    macro_rules! jp_cc {
      ($cond:expr) => {{
        if $cond {
          jp!()
        } else {
          self.regs.pc = self.regs.pc.wrapping_add(2);
          3
        }
      }}
    }
    macro_rules! jr {
      () => {{
        // PC first advances past the operand, then takes the displacement.
        let n = fetch8!() as i8;
        self.regs.pc = self.regs.pc.wrapping_add(n as u16);
        3
      }}
    }
    macro_rules! jr_cc {
      ($cond:expr) => {{
        if $cond {
          jr!()
        } else {
          self.regs.pc = self.regs.pc.wrapping_add(1);
          2
        }
      }}
    }
    macro_rules! call {
      () => {{
        let target = fetch16!();
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        mem.ww(self.regs.sp, self.regs.pc);
        self.regs.pc = target;
        6
      }}
    }
    macro_rules! call_cc {
      ($cond:expr) => {{
        if $cond {
          call!()
        } else {
          self.regs.pc = self.regs.pc.wrapping_add(2);
          3
        }
      }}
    }
    macro_rules! ret {
      () => {{
        self.regs.pc = mem.rw(self.regs.sp);
        self.regs.sp = self.regs.sp.wrapping_add(2);
        4
      }}
    }
    macro_rules! ret_cc {
      ($cond:expr) => {{
        if $cond {
          ret!();
          5
        } else {
          2
        }
      }}
    }
    macro_rules! rst {
      ($vector:expr) => {{
        self.regs.sp = self.regs.sp.wrapping_sub(2);
        mem.ww(self.regs.sp, self.regs.pc);
        self.regs.pc = $vector;
        4
      }}
    }

    let opcode = fetch8!();
    self.regs.bump_r();
    trace!("{:#06x}: op {:#04x}", start, opcode);

    let m = match opcode {
      0x00 => 1, // nop
      0x01 => ld_rr_nn!(b, c),
      0x02 => ld_rrm_r!(bc, a),
      0x03 => inc16!(b, c),
      0x04 => inc8!(self.regs.b),
      0x05 => dec8!(self.regs.b),
      0x06 => ld_r_n!(b),
      0x07 => {
        // RLCA: circular; Z/N/H always clear.
        let a = self.regs.a;
        let out = a >> 7;
        self.regs.a = (a << 1) | out;
        self.regs.f = if out == 1 { reg::C } else { 0 };
        1
      }
      0x08 => {
        let nn = fetch16!();
        mem.ww(nn, self.regs.sp);
        5
      }
      0x09 => add_hl!(self.regs.bc()),
      0x0a => ld_r_rrm!(a, bc),
      0x0b => dec16!(b, c),
      0x0c => inc8!(self.regs.c),
      0x0d => dec8!(self.regs.c),
      0x0e => ld_r_n!(c),
      0x0f => {
        // RRCA
        let a = self.regs.a;
        let out = a & 0x1;
        self.regs.a = (a >> 1) | (out << 7);
        self.regs.f = if out == 1 { reg::C } else { 0 };
        1
      }

      0x10 => {
        // DJNZ: B is decremented first, no flag effect.
        self.regs.b = self.regs.b.wrapping_sub(1);
        jr_cc!(self.regs.b != 0)
      }
      0x11 => ld_rr_nn!(d, e),
      0x12 => ld_rrm_r!(de, a),
      0x13 => inc16!(d, e),
      0x14 => inc8!(self.regs.d),
      0x15 => dec8!(self.regs.d),
      0x16 => ld_r_n!(d),
      0x17 => {
        // RLA: through carry.
        let a = self.regs.a;
        let cin = if self.regs.c() { 1 } else { 0 };
        let out = a >> 7;
        self.regs.a = (a << 1) | cin;
        self.regs.f = if out == 1 { reg::C } else { 0 };
        1
      }
      0x18 => jr!(),
      0x19 => add_hl!(self.regs.de()),
      0x1a => ld_r_rrm!(a, de),
      0x1b => dec16!(d, e),
      0x1c => inc8!(self.regs.e),
      0x1d => dec8!(self.regs.e),
      0x1e => ld_r_n!(e),
      0x1f => {
        // RRA
        let a = self.regs.a;
        let cin = if self.regs.c() { 0x80 } else { 0 };
        let out = a & 0x1;
        self.regs.a = (a >> 1) | cin;
        self.regs.f = if out == 1 { reg::C } else { 0 };
        1
      }

      0x20 => jr_cc!(!self.regs.z()),
      0x21 => ld_rr_nn!(h, l),
      0x22 => {
        ld_rrm_r!(hl, a);
        self.regs.hl_inc();
        2
      }
      0x23 => inc16!(h, l),
      0x24 => inc8!(self.regs.h),
      0x25 => dec8!(self.regs.h),
      0x26 => ld_r_n!(h),
      0x27 => {
        // DAA: BCD adjust after an add or subtract.
        let mut a = self.regs.a;
        let mut adjust = if self.regs.c() { 0x60 } else { 0x00 };
        if self.regs.h() {
          adjust |= 0x06;
        }
        if !self.regs.n() {
          if a & 0x0f > 0x09 {
            adjust |= 0x06;
          }
          if a > 0x99 {
            adjust |= 0x60;
          }
          a = a.wrapping_add(adjust);
        } else {
          a = a.wrapping_sub(adjust);
        }
        self.regs.a = a;
        let n = self.regs.f & reg::N;
        self.regs.f = n;
        if a == 0 {
          self.regs.f |= reg::Z;
        }
        if adjust >= 0x60 {
          self.regs.f |= reg::C;
        }
        1
      }
      0x28 => jr_cc!(self.regs.z()),
      0x29 => add_hl!(self.regs.hl()),
      0x2a => {
        ld_r_rrm!(a, hl);
        self.regs.hl_inc();
        2
      }
      0x2b => dec16!(h, l),
      0x2c => inc8!(self.regs.l),
      0x2d => dec8!(self.regs.l),
      0x2e => ld_r_n!(l),
      0x2f => {
        // CPL
        self.regs.a = !self.regs.a;
        let f = self.regs.f;
        self.regs.f = (f & (reg::Z | reg::C)) | reg::N | reg::H;
        1
      }

      0x30 => jr_cc!(!self.regs.c()),
      0x31 => {
        self.regs.sp = fetch16!();
        3
      }
      0x32 => {
        ld_rrm_r!(hl, a);
        self.regs.hl_dec();
        2
      }
      0x33 => {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        2
      }
      0x34 => {
        let addr = self.regs.hl();
        let n = mem.rb(addr);
        let result = n.wrapping_add(1);
        mem.wb(addr, result);
        let carry = self.regs.f & reg::C;
        self.regs.set_zn(result, false);
        if n & 0xf == 0xf {
          self.regs.f |= reg::H;
        }
        self.regs.f |= carry;
        3
      }
      0x35 => {
        let addr = self.regs.hl();
        let n = mem.rb(addr);
        let result = n.wrapping_sub(1);
        mem.wb(addr, result);
        let carry = self.regs.f & reg::C;
        self.regs.set_zn(result, true);
        if n & 0xf == 0 {
          self.regs.f |= reg::H;
        }
        self.regs.f |= carry;
        3
      }
      0x36 => {
        let n = fetch8!();
        mem.wb(self.regs.hl(), n);
        3
      }
      0x37 => {
        // SCF
        self.regs.f = (self.regs.f & reg::Z) | reg::C;
        1
      }
      0x38 => jr_cc!(self.regs.c()),
      0x39 => add_hl!(self.regs.sp),
      0x3a => {
        ld_r_rrm!(a, hl);
        self.regs.hl_dec();
        2
      }
      0x3b => {
        self.regs.sp = self.regs.sp.wrapping_sub(1);
        2
      }
      0x3c => inc8!(self.regs.a),
      0x3d => dec8!(self.regs.a),
      0x3e => ld_r_n!(a),
      0x3f => {
        // CCF
        self.regs.f = (self.regs.f & reg::Z) | ((self.regs.f & reg::C) ^ reg::C);
        1
      }

      0x40 => ld_r_r!(b, b),
      0x41 => ld_r_r!(b, c),
      0x42 => ld_r_r!(b, d),
      0x43 => ld_r_r!(b, e),
      0x44 => ld_r_r!(b, h),
      0x45 => ld_r_r!(b, l),
      0x46 => ld_r_rrm!(b, hl),
      0x47 => ld_r_r!(b, a),
      0x48 => ld_r_r!(c, b),
      0x49 => ld_r_r!(c, c),
      0x4a => ld_r_r!(c, d),
      0x4b => ld_r_r!(c, e),
      0x4c => ld_r_r!(c, h),
      0x4d => ld_r_r!(c, l),
      0x4e => ld_r_rrm!(c, hl),
      0x4f => ld_r_r!(c, a),

      0x50 => ld_r_r!(d, b),
      0x51 => ld_r_r!(d, c),
      0x52 => ld_r_r!(d, d),
      0x53 => ld_r_r!(d, e),
      0x54 => ld_r_r!(d, h),
      0x55 => ld_r_r!(d, l),
      0x56 => ld_r_rrm!(d, hl),
      0x57 => ld_r_r!(d, a),
      0x58 => ld_r_r!(e, b),
      0x59 => ld_r_r!(e, c),
      0x5a => ld_r_r!(e, d),
      0x5b => ld_r_r!(e, e),
      0x5c => ld_r_r!(e, h),
      0x5d => ld_r_r!(e, l),
      0x5e => ld_r_rrm!(e, hl),
      0x5f => ld_r_r!(e, a),

      0x60 => ld_r_r!(h, b),
      0x61 => ld_r_r!(h, c),
      0x62 => ld_r_r!(h, d),
      0x63 => ld_r_r!(h, e),
      0x64 => ld_r_r!(h, h),
      0x65 => ld_r_r!(h, l),
      0x66 => ld_r_rrm!(h, hl),
      0x67 => ld_r_r!(h, a),
      0x68 => ld_r_r!(l, b),
      0x69 => ld_r_r!(l, c),
      0x6a => ld_r_r!(l, d),
      0x6b => ld_r_r!(l, e),
      0x6c => ld_r_r!(l, h),
      0x6d => ld_r_r!(l, l),
      0x6e => ld_r_rrm!(l, hl),
      0x6f => ld_r_r!(l, a),

      0x70 => ld_rrm_r!(hl, b),
      0x71 => ld_rrm_r!(hl, c),
      0x72 => ld_rrm_r!(hl, d),
      0x73 => ld_rrm_r!(hl, e),
      0x74 => ld_rrm_r!(hl, h),
      0x75 => ld_rrm_r!(hl, l),
      0x76 => {
        self.halt = true;
        1
      }
      0x77 => ld_rrm_r!(hl, a),
      0x78 => ld_r_r!(a, b),
      0x79 => ld_r_r!(a, c),
      0x7a => ld_r_r!(a, d),
      0x7b => ld_r_r!(a, e),
      0x7c => ld_r_r!(a, h),
      0x7d => ld_r_r!(a, l),
      0x7e => ld_r_rrm!(a, hl),
      0x7f => ld_r_r!(a, a),

      0x80 => add_a!(self.regs.b),
      0x81 => add_a!(self.regs.c),
      0x82 => add_a!(self.regs.d),
      0x83 => add_a!(self.regs.e),
      0x84 => add_a!(self.regs.h),
      0x85 => add_a!(self.regs.l),
      0x86 => {
        add_a!(mem.rb(self.regs.hl()));
        2
      }
      0x87 => add_a!(self.regs.a),
      0x88 => adc_a!(self.regs.b),
      0x89 => adc_a!(self.regs.c),
      0x8a => adc_a!(self.regs.d),
      0x8b => adc_a!(self.regs.e),
      0x8c => adc_a!(self.regs.h),
      0x8d => adc_a!(self.regs.l),
      0x8e => {
        adc_a!(mem.rb(self.regs.hl()));
        2
      }
      0x8f => adc_a!(self.regs.a),

      0x90 => sub_a!(self.regs.b),
      0x91 => sub_a!(self.regs.c),
      0x92 => sub_a!(self.regs.d),
      0x93 => sub_a!(self.regs.e),
      0x94 => sub_a!(self.regs.h),
      0x95 => sub_a!(self.regs.l),
      0x96 => {
        sub_a!(mem.rb(self.regs.hl()));
        2
      }
      0x97 => sub_a!(self.regs.a),
      0x98 => sbc_a!(self.regs.b),
      0x99 => sbc_a!(self.regs.c),
      0x9a => sbc_a!(self.regs.d),
      0x9b => sbc_a!(self.regs.e),
      0x9c => sbc_a!(self.regs.h),
      0x9d => sbc_a!(self.regs.l),
      0x9e => {
        sbc_a!(mem.rb(self.regs.hl()));
        2
      }
      0x9f => sbc_a!(self.regs.a),

      0xa0 => and_a!(self.regs.b),
      0xa1 => and_a!(self.regs.c),
      0xa2 => and_a!(self.regs.d),
      0xa3 => and_a!(self.regs.e),
      0xa4 => and_a!(self.regs.h),
      0xa5 => and_a!(self.regs.l),
      0xa6 => {
        and_a!(mem.rb(self.regs.hl()));
        2
      }
      0xa7 => and_a!(self.regs.a),
      0xa8 => xor_a!(self.regs.b),
      0xa9 => xor_a!(self.regs.c),
      0xaa => xor_a!(self.regs.d),
      0xab => xor_a!(self.regs.e),
      0xac => xor_a!(self.regs.h),
      0xad => xor_a!(self.regs.l),
      0xae => {
        xor_a!(mem.rb(self.regs.hl()));
        2
      }
      0xaf => xor_a!(self.regs.a),

      0xb0 => or_a!(self.regs.b),
      0xb1 => or_a!(self.regs.c),
      0xb2 => or_a!(self.regs.d),
      0xb3 => or_a!(self.regs.e),
      0xb4 => or_a!(self.regs.h),
      0xb5 => or_a!(self.regs.l),
      0xb6 => {
        or_a!(mem.rb(self.regs.hl()));
        2
      }
      0xb7 => or_a!(self.regs.a),
      0xb8 => cp_a!(self.regs.b),
      0xb9 => cp_a!(self.regs.c),
      0xba => cp_a!(self.regs.d),
      0xbb => cp_a!(self.regs.e),
      0xbc => cp_a!(self.regs.h),
      0xbd => cp_a!(self.regs.l),
      0xbe => {
        cp_a!(mem.rb(self.regs.hl()));
        2
      }
      0xbf => cp_a!(self.regs.a),

      0xc0 => ret_cc!(!self.regs.z()),
      0xc1 => pop!(b, c),
      0xc2 => jp_cc!(!self.regs.z()),
      0xc3 => jp!(),
      0xc4 => call_cc!(!self.regs.z()),
      0xc5 => push!(b, c),
      0xc6 => {
        let n = fetch8!();
        add_a!(n);
        2
      }
      0xc7 => rst!(0x00),
      0xc8 => ret_cc!(self.regs.z()),
      0xc9 => ret!(),
      0xca => jp_cc!(self.regs.z()),
      0xcb => self.exec_cb(mem),
      0xcc => call_cc!(self.regs.z()),
      0xcd => call!(),
      0xce => {
        let n = fetch8!();
        adc_a!(n);
        2
      }
      0xcf => rst!(0x08),

      0xd0 => ret_cc!(!self.regs.c()),
      0xd1 => pop!(d, e),
      0xd2 => jp_cc!(!self.regs.c()),
      0xd3 => illegal!(0xd3),
      0xd4 => call_cc!(!self.regs.c()),
      0xd5 => push!(d, e),
      0xd6 => {
        let n = fetch8!();
        sub_a!(n);
        2
      }
      0xd7 => rst!(0x10),
      0xd8 => ret_cc!(self.regs.c()),
      0xd9 => {
        // RETI
        ret!();
        self.ime = true;
        4
      }
      0xda => jp_cc!(self.regs.c()),
      0xdb => illegal!(0xdb),
      0xdc => call_cc!(self.regs.c()),
      0xdd => illegal!(0xdd),
      0xde => {
        let n = fetch8!();
        sbc_a!(n);
        2
      }
      0xdf => rst!(0x18),

      0xe0 => {
        let n = fetch8!();
        mem.wb(0xff00 + u16::from(n), self.regs.a);
        3
      }
      0xe1 => pop!(h, l),
      0xe2 => {
        mem.wb(0xff00 + u16::from(self.regs.c), self.regs.a);
        2
      }
      0xe3 => illegal!(0xe3),
      0xe4 => illegal!(0xe4),
      0xe5 => push!(h, l),
      0xe6 => {
        let n = fetch8!();
        and_a!(n);
        2
      }
      0xe7 => rst!(0x20),
      0xe8 => {
        // ADD SP,n: signed immediate; H/C come from the low-byte add.
        let sp = self.regs.sp;
        let n = fetch8!() as i8 as u16;
        let result = sp.wrapping_add(n);
        let tmp = sp ^ n ^ result;
        self.regs.f = 0;
        if tmp & 0x10 != 0 {
          self.regs.f |= reg::H;
        }
        if tmp & 0x100 != 0 {
          self.regs.f |= reg::C;
        }
        self.regs.sp = result;
        4
      }
      0xe9 => {
        self.regs.pc = self.regs.hl();
        1
      }
      0xea => {
        let nn = fetch16!();
        mem.wb(nn, self.regs.a);
        4
      }
      0xeb => illegal!(0xeb),
      0xec => illegal!(0xec),
      0xed => illegal!(0xed),
      0xee => {
        let n = fetch8!();
        xor_a!(n);
        2
      }
      0xef => rst!(0x28),

      0xf0 => {
        let n = fetch8!();
        self.regs.a = mem.rb(0xff00 + u16::from(n));
        3
      }
      0xf1 => {
        let m = pop!(a, f);
        // The low nibble of F does not exist in hardware.
        self.regs.f &= 0xf0;
        m
      }
      0xf2 => {
        self.regs.a = mem.rb(0xff00 + u16::from(self.regs.c));
        2
      }
      0xf3 => {
        self.ime = false;
        1
      }
      0xf4 => illegal!(0xf4),
      0xf5 => push!(a, f),
      0xf6 => {
        let n = fetch8!();
        or_a!(n);
        2
      }
      0xf7 => rst!(0x30),
      0xf8 => {
        let sp = self.regs.sp;
        let n = fetch8!() as i8 as u16;
        let result = sp.wrapping_add(n);
        let tmp = sp ^ n ^ result;
        self.regs.f = 0;
        if tmp & 0x10 != 0 {
          self.regs.f |= reg::H;
        }
        if tmp & 0x100 != 0 {
          self.regs.f |= reg::C;
        }
        self.regs.set_hl(result);
        3
      }
      0xf9 => {
        self.regs.sp = self.regs.hl();
        2
      }
      0xfa => {
        let nn = fetch16!();
        self.regs.a = mem.rb(nn);
        4
      }
      0xfb => {
        self.ime = true;
        1
      }
      0xfc => illegal!(0xfc),
      0xfd => illegal!(0xfd),
      0xfe => {
        let n = fetch8!();
        cp_a!(n);
        2
      }
      0xff => rst!(0x38),
    };
    Ok(m)
  }

  /// Run a CB-prefixed instruction. The extended table is fully assigned, so
  /// this path cannot fail.
  fn exec_cb<M: Memory>(&mut self, mem: &mut M) -> u32 {
    macro_rules! fetch8 {
      () => {{
        let result = mem.rb(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        result
      }}
    }

    macro_rules! with_hl {
      ($byte:ident, $body:expr) => {{
        let addr = self.regs.hl();
        let mut $byte = mem.rb(addr);
        $body;
        mem.wb(addr, $byte);
        4
      }}
    }

    macro_rules! rlc8 {
      ($r:expr) => {{
        let v = $r;
        let out = v >> 7;
        let result = (v << 1) | out;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! rrc8 {
      ($r:expr) => {{
        let v = $r;
        let out = v & 0x1;
        let result = (v >> 1) | (out << 7);
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! rl8 {
      ($r:expr) => {{
        let v = $r;
        let cin = if self.regs.c() { 1 } else { 0 };
        let out = v >> 7;
        let result = (v << 1) | cin;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! rr8 {
      ($r:expr) => {{
        let v = $r;
        let cin = if self.regs.c() { 0x80 } else { 0 };
        let out = v & 0x1;
        let result = (v >> 1) | cin;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! sla8 {
      ($r:expr) => {{
        let v = $r;
        let out = v >> 7;
        let result = v << 1;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! sra8 {
      ($r:expr) => {{
        let v = $r;
        let out = v & 0x1;
        // Bit 7 is preserved.
        let result = ((v as i8) >> 1) as u8;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! srl8 {
      ($r:expr) => {{
        let v = $r;
        let out = v & 0x1;
        let result = v >> 1;
        $r = result;
        self.regs.set_zn(result, false);
        if out == 1 {
          self.regs.f |= reg::C;
        }
        2
      }}
    }
    macro_rules! swap8 {
      ($r:expr) => {{
        let v = $r;
        let result = (v << 4) | (v >> 4);
        $r = result;
        self.regs.set_zn(result, false);
        2
      }}
    }

    macro_rules! bit8 {
      ($r:expr, $b:expr) => {{
        let set = $r & (1 << $b) != 0;
        let carry = self.regs.f & reg::C;
        self.regs.f = reg::H | carry | if set { 0 } else { reg::Z };
        2
      }}
    }
    macro_rules! res8 {
      ($r:expr, $b:expr) => {{
        $r &= !(1 << $b);
        2
      }}
    }
    macro_rules! set8 {
      ($r:expr, $b:expr) => {{
        $r |= 1 << $b;
        2
      }}
    }

    let opcode = fetch8!();
    self.regs.bump_r();

    match opcode {
      0x00 => rlc8!(self.regs.b),
      0x01 => rlc8!(self.regs.c),
      0x02 => rlc8!(self.regs.d),
      0x03 => rlc8!(self.regs.e),
      0x04 => rlc8!(self.regs.h),
      0x05 => rlc8!(self.regs.l),
      0x06 => with_hl!(v, rlc8!(v)),
      0x07 => rlc8!(self.regs.a),
      0x08 => rrc8!(self.regs.b),
      0x09 => rrc8!(self.regs.c),
      0x0a => rrc8!(self.regs.d),
      0x0b => rrc8!(self.regs.e),
      0x0c => rrc8!(self.regs.h),
      0x0d => rrc8!(self.regs.l),
      0x0e => with_hl!(v, rrc8!(v)),
      0x0f => rrc8!(self.regs.a),

      0x10 => rl8!(self.regs.b),
      0x11 => rl8!(self.regs.c),
      0x12 => rl8!(self.regs.d),
      0x13 => rl8!(self.regs.e),
      0x14 => rl8!(self.regs.h),
      0x15 => rl8!(self.regs.l),
      0x16 => with_hl!(v, rl8!(v)),
      0x17 => rl8!(self.regs.a),
      0x18 => rr8!(self.regs.b),
      0x19 => rr8!(self.regs.c),
      0x1a => rr8!(self.regs.d),
      0x1b => rr8!(self.regs.e),
      0x1c => rr8!(self.regs.h),
      0x1d => rr8!(self.regs.l),
      0x1e => with_hl!(v, rr8!(v)),
      0x1f => rr8!(self.regs.a),

      0x20 => sla8!(self.regs.b),
      0x21 => sla8!(self.regs.c),
      0x22 => sla8!(self.regs.d),
      0x23 => sla8!(self.regs.e),
      0x24 => sla8!(self.regs.h),
      0x25 => sla8!(self.regs.l),
      0x26 => with_hl!(v, sla8!(v)),
      0x27 => sla8!(self.regs.a),
      0x28 => sra8!(self.regs.b),
      0x29 => sra8!(self.regs.c),
      0x2a => sra8!(self.regs.d),
      0x2b => sra8!(self.regs.e),
      0x2c => sra8!(self.regs.h),
      0x2d => sra8!(self.regs.l),
      0x2e => with_hl!(v, sra8!(v)),
      0x2f => sra8!(self.regs.a),

      0x30 => swap8!(self.regs.b),
      0x31 => swap8!(self.regs.c),
      0x32 => swap8!(self.regs.d),
      0x33 => swap8!(self.regs.e),
      0x34 => swap8!(self.regs.h),
      0x35 => swap8!(self.regs.l),
      0x36 => with_hl!(v, swap8!(v)),
      0x37 => swap8!(self.regs.a),
      0x38 => srl8!(self.regs.b),
      0x39 => srl8!(self.regs.c),
      0x3a => srl8!(self.regs.d),
      0x3b => srl8!(self.regs.e),
      0x3c => srl8!(self.regs.h),
      0x3d => srl8!(self.regs.l),
      0x3e => with_hl!(v, srl8!(v)),
      0x3f => srl8!(self.regs.a),

      0x40 => bit8!(self.regs.b, 0),
      0x41 => bit8!(self.regs.c, 0),
      0x42 => bit8!(self.regs.d, 0),
      0x43 => bit8!(self.regs.e, 0),
      0x44 => bit8!(self.regs.h, 0),
      0x45 => bit8!(self.regs.l, 0),
      0x46 => {
        bit8!(mem.rb(self.regs.hl()), 0);
        3
      }
      0x47 => bit8!(self.regs.a, 0),
      0x48 => bit8!(self.regs.b, 1),
      0x49 => bit8!(self.regs.c, 1),
      0x4a => bit8!(self.regs.d, 1),
      0x4b => bit8!(self.regs.e, 1),
      0x4c => bit8!(self.regs.h, 1),
      0x4d => bit8!(self.regs.l, 1),
      0x4e => {
        bit8!(mem.rb(self.regs.hl()), 1);
        3
      }
      0x4f => bit8!(self.regs.a, 1),

      0x50 => bit8!(self.regs.b, 2),
      0x51 => bit8!(self.regs.c, 2),
      0x52 => bit8!(self.regs.d, 2),
      0x53 => bit8!(self.regs.e, 2),
      0x54 => bit8!(self.regs.h, 2),
      0x55 => bit8!(self.regs.l, 2),
      0x56 => {
        bit8!(mem.rb(self.regs.hl()), 2);
        3
      }
      0x57 => bit8!(self.regs.a, 2),
      0x58 => bit8!(self.regs.b, 3),
      0x59 => bit8!(self.regs.c, 3),
      0x5a => bit8!(self.regs.d, 3),
      0x5b => bit8!(self.regs.e, 3),
      0x5c => bit8!(self.regs.h, 3),
      0x5d => bit8!(self.regs.l, 3),
      0x5e => {
        bit8!(mem.rb(self.regs.hl()), 3);
        3
      }
      0x5f => bit8!(self.regs.a, 3),

      0x60 => bit8!(self.regs.b, 4),
      0x61 => bit8!(self.regs.c, 4),
      0x62 => bit8!(self.regs.d, 4),
      0x63 => bit8!(self.regs.e, 4),
      0x64 => bit8!(self.regs.h, 4),
      0x65 => bit8!(self.regs.l, 4),
      0x66 => {
        bit8!(mem.rb(self.regs.hl()), 4);
        3
      }
      0x67 => bit8!(self.regs.a, 4),
      0x68 => bit8!(self.regs.b, 5),
      0x69 => bit8!(self.regs.c, 5),
      0x6a => bit8!(self.regs.d, 5),
      0x6b => bit8!(self.regs.e, 5),
      0x6c => bit8!(self.regs.h, 5),
      0x6d => bit8!(self.regs.l, 5),
      0x6e => {
        bit8!(mem.rb(self.regs.hl()), 5);
        3
      }
      0x6f => bit8!(self.regs.a, 5),

      0x70 => bit8!(self.regs.b, 6),
      0x71 => bit8!(self.regs.c, 6),
      0x72 => bit8!(self.regs.d, 6),
      0x73 => bit8!(self.regs.e, 6),
      0x74 => bit8!(self.regs.h, 6),
      0x75 => bit8!(self.regs.l, 6),
      0x76 => {
        bit8!(mem.rb(self.regs.hl()), 6);
        3
      }
      0x77 => bit8!(self.regs.a, 6),
      0x78 => bit8!(self.regs.b, 7),
      0x79 => bit8!(self.regs.c, 7),
      0x7a => bit8!(self.regs.d, 7),
      0x7b => bit8!(self.regs.e, 7),
      0x7c => bit8!(self.regs.h, 7),
      0x7d => bit8!(self.regs.l, 7),
      0x7e => {
        bit8!(mem.rb(self.regs.hl()), 7);
        3
      }
      0x7f => bit8!(self.regs.a, 7),

      0x80 => res8!(self.regs.b, 0),
      0x81 => res8!(self.regs.c, 0),
      0x82 => res8!(self.regs.d, 0),
      0x83 => res8!(self.regs.e, 0),
      0x84 => res8!(self.regs.h, 0),
      0x85 => res8!(self.regs.l, 0),
      0x86 => with_hl!(v, res8!(v, 0)),
      0x87 => res8!(self.regs.a, 0),
      0x88 => res8!(self.regs.b, 1),
      0x89 => res8!(self.regs.c, 1),
      0x8a => res8!(self.regs.d, 1),
      0x8b => res8!(self.regs.e, 1),
      0x8c => res8!(self.regs.h, 1),
      0x8d => res8!(self.regs.l, 1),
      0x8e => with_hl!(v, res8!(v, 1)),
      0x8f => res8!(self.regs.a, 1),

      0x90 => res8!(self.regs.b, 2),
      0x91 => res8!(self.regs.c, 2),
      0x92 => res8!(self.regs.d, 2),
      0x93 => res8!(self.regs.e, 2),
      0x94 => res8!(self.regs.h, 2),
      0x95 => res8!(self.regs.l, 2),
      0x96 => with_hl!(v, res8!(v, 2)),
      0x97 => res8!(self.regs.a, 2),
      0x98 => res8!(self.regs.b, 3),
      0x99 => res8!(self.regs.c, 3),
      0x9a => res8!(self.regs.d, 3),
      0x9b => res8!(self.regs.e, 3),
      0x9c => res8!(self.regs.h, 3),
      0x9d => res8!(self.regs.l, 3),
      0x9e => with_hl!(v, res8!(v, 3)),
      0x9f => res8!(self.regs.a, 3),

      0xa0 => res8!(self.regs.b, 4),
      0xa1 => res8!(self.regs.c, 4),
      0xa2 => res8!(self.regs.d, 4),
      0xa3 => res8!(self.regs.e, 4),
      0xa4 => res8!(self.regs.h, 4),
      0xa5 => res8!(self.regs.l, 4),
      0xa6 => with_hl!(v, res8!(v, 4)),
      0xa7 => res8!(self.regs.a, 4),
      0xa8 => res8!(self.regs.b, 5),
      0xa9 => res8!(self.regs.c, 5),
      0xaa => res8!(self.regs.d, 5),
      0xab => res8!(self.regs.e, 5),
      0xac => res8!(self.regs.h, 5),
      0xad => res8!(self.regs.l, 5),
      0xae => with_hl!(v, res8!(v, 5)),
      0xaf => res8!(self.regs.a, 5),

      0xb0 => res8!(self.regs.b, 6),
      0xb1 => res8!(self.regs.c, 6),
      0xb2 => res8!(self.regs.d, 6),
      0xb3 => res8!(self.regs.e, 6),
      0xb4 => res8!(self.regs.h, 6),
      0xb5 => res8!(self.regs.l, 6),
      0xb6 => with_hl!(v, res8!(v, 6)),
      0xb7 => res8!(self.regs.a, 6),
      0xb8 => res8!(self.regs.b, 7),
      0xb9 => res8!(self.regs.c, 7),
      0xba => res8!(self.regs.d, 7),
      0xbb => res8!(self.regs.e, 7),
      0xbc => res8!(self.regs.h, 7),
      0xbd => res8!(self.regs.l, 7),
      0xbe => with_hl!(v, res8!(v, 7)),
      0xbf => res8!(self.regs.a, 7),

      0xc0 => set8!(self.regs.b, 0),
      0xc1 => set8!(self.regs.c, 0),
      0xc2 => set8!(self.regs.d, 0),
      0xc3 => set8!(self.regs.e, 0),
      0xc4 => set8!(self.regs.h, 0),
      0xc5 => set8!(self.regs.l, 0),
      0xc6 => with_hl!(v, set8!(v, 0)),
      0xc7 => set8!(self.regs.a, 0),
      0xc8 => set8!(self.regs.b, 1),
      0xc9 => set8!(self.regs.c, 1),
      0xca => set8!(self.regs.d, 1),
      0xcb => set8!(self.regs.e, 1),
      0xcc => set8!(self.regs.h, 1),
      0xcd => set8!(self.regs.l, 1),
      0xce => with_hl!(v, set8!(v, 1)),
      0xcf => set8!(self.regs.a, 1),

      0xd0 => set8!(self.regs.b, 2),
      0xd1 => set8!(self.regs.c, 2),
      0xd2 => set8!(self.regs.d, 2),
      0xd3 => set8!(self.regs.e, 2),
      0xd4 => set8!(self.regs.h, 2),
      0xd5 => set8!(self.regs.l, 2),
      0xd6 => with_hl!(v, set8!(v, 2)),
      0xd7 => set8!(self.regs.a, 2),
      0xd8 => set8!(self.regs.b, 3),
      0xd9 => set8!(self.regs.c, 3),
      0xda => set8!(self.regs.d, 3),
      0xdb => set8!(self.regs.e, 3),
      0xdc => set8!(self.regs.h, 3),
      0xdd => set8!(self.regs.l, 3),
      0xde => with_hl!(v, set8!(v, 3)),
      0xdf => set8!(self.regs.a, 3),

      0xe0 => set8!(self.regs.b, 4),
      0xe1 => set8!(self.regs.c, 4),
      0xe2 => set8!(self.regs.d, 4),
      0xe3 => set8!(self.regs.e, 4),
      0xe4 => set8!(self.regs.h, 4),
      0xe5 => set8!(self.regs.l, 4),
      0xe6 => with_hl!(v, set8!(v, 4)),
      0xe7 => set8!(self.regs.a, 4),
      0xe8 => set8!(self.regs.b, 5),
      0xe9 => set8!(self.regs.c, 5),
      0xea => set8!(self.regs.d, 5),
      0xeb => set8!(self.regs.e, 5),
      0xec => set8!(self.regs.h, 5),
      0xed => set8!(self.regs.l, 5),
      0xee => with_hl!(v, set8!(v, 5)),
      0xef => set8!(self.regs.a, 5),

      0xf0 => set8!(self.regs.b, 6),
      0xf1 => set8!(self.regs.c, 6),
      0xf2 => set8!(self.regs.d, 6),
      0xf3 => set8!(self.regs.e, 6),
      0xf4 => set8!(self.regs.h, 6),
      0xf5 => set8!(self.regs.l, 6),
      0xf6 => with_hl!(v, set8!(v, 6)),
      0xf7 => set8!(self.regs.a, 6),
      0xf8 => set8!(self.regs.b, 7),
      0xf9 => set8!(self.regs.c, 7),
      0xfa => set8!(self.regs.d, 7),
      0xfb => set8!(self.regs.e, 7),
      0xfc => set8!(self.regs.h, 7),
      0xfd => set8!(self.regs.l, 7),
      0xfe => with_hl!(v, set8!(v, 7)),
      0xff => set8!(self.regs.a, 7),
    }
  }
}

impl Default for CPU {
  fn default() -> CPU {
    CPU::new()
  }
}
