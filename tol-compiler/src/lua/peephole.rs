//! Post-emission peephole pass over a finished prototype.
//!
//! Three rewrites, none of which may change observable semantics: runs of
//! contiguous `MOVE` collapse into one `MOVEN` (the tail becomes `NOP` so
//! jump targets stay valid), jump chains resolve to their final
//! destination, and self-jumps become `NOP`. The pass also settles the
//! used-register count recorded in the prototype header.

use std::collections::BTreeSet;

use tol_asm::{Instruction, OpCode, Prototype};

/// Apply the pass in place.
pub fn patch_code(proto: &mut Prototype) {
    let skip = pseudo_words(proto);
    collapse_jump_chains(proto, &skip);
    collapse_move_runs(proto, &skip);
    settle_max_stack(proto);
}

/// Words that are data or pseudo-instructions: `SETLIST` block indexes and
/// the upvalue-binding instructions following `CLOSURE`. The pass must not
/// rewrite them.
fn pseudo_words(proto: &Prototype) -> BTreeSet<usize> {
    let mut skip = BTreeSet::new();
    let mut pc = 0usize;
    while pc < proto.code.len() {
        let ins = Instruction::from_word(proto.code[pc]);
        match ins.op() {
            Ok(OpCode::SetList) if ins.c() == 0 => {
                skip.insert(pc + 1);
                pc += 1;
            }
            Ok(OpCode::Closure) => {
                let count = proto
                    .protos
                    .get(ins.bx() as usize)
                    .map(|p| p.num_upvalues as usize)
                    .unwrap_or(0);
                for offset in 1..=count {
                    skip.insert(pc + offset);
                }
                pc += count;
            }
            _ => {}
        }
        pc += 1;
    }
    skip
}

fn jump_targets(proto: &Prototype, skip: &BTreeSet<usize>) -> BTreeSet<usize> {
    let mut targets = BTreeSet::new();
    for (pc, &word) in proto.code.iter().enumerate() {
        if skip.contains(&pc) {
            continue;
        }
        let ins = Instruction::from_word(word);
        match ins.op() {
            Ok(OpCode::Jmp) | Ok(OpCode::ForLoop) | Ok(OpCode::ForPrep) => {
                let target = pc as i64 + 1 + i64::from(ins.sbx());
                if target >= 0 {
                    targets.insert(target as usize);
                }
            }
            // Skip-next instructions make pc+2 a join point.
            Ok(OpCode::Eq)
            | Ok(OpCode::Lt)
            | Ok(OpCode::Le)
            | Ok(OpCode::Test)
            | Ok(OpCode::TestSet)
            | Ok(OpCode::TForLoop) => {
                targets.insert(pc + 2);
            }
            Ok(OpCode::LoadBool) if ins.c() != 0 => {
                targets.insert(pc + 2);
            }
            _ => {}
        }
    }
    targets
}

fn collapse_jump_chains(proto: &mut Prototype, skip: &BTreeSet<usize>) {
    for pc in 0..proto.code.len() {
        if skip.contains(&pc) {
            continue;
        }
        let ins = Instruction::from_word(proto.code[pc]);
        if ins.op() != Ok(OpCode::Jmp) {
            continue;
        }
        // Follow the chain; a visited set guards against jump cycles.
        let mut seen = BTreeSet::new();
        let mut target = pc as i64 + 1 + i64::from(ins.sbx());
        loop {
            if !seen.insert(target) {
                break;
            }
            let Some(&word) = proto.code.get(target as usize) else {
                break;
            };
            if skip.contains(&(target as usize)) {
                break;
            }
            let next = Instruction::from_word(word);
            if next.op() != Ok(OpCode::Jmp) {
                break;
            }
            target = target + 1 + i64::from(next.sbx());
        }
        let sbx = target - (pc as i64 + 1);
        if sbx == 0 {
            // A jump to the next instruction does nothing.
            proto.code[pc] = Instruction::abc(OpCode::Nop, 0, 0, 0).word();
        } else {
            proto.code[pc] =
                Instruction::asbx(OpCode::Jmp, ins.a(), sbx as i32).word();
        }
    }
}

fn collapse_move_runs(proto: &mut Prototype, skip: &BTreeSet<usize>) {
    let targets = jump_targets(proto, skip);
    let len = proto.code.len();
    let mut pc = 0usize;
    while pc < len {
        if skip.contains(&pc) || !is_plain_move(proto, pc, skip) {
            pc += 1;
            continue;
        }
        let first = Instruction::from_word(proto.code[pc]);
        let mut run = 1usize;
        while pc + run < len
            && run < 0x1ff
            && !skip.contains(&(pc + run))
            && !targets.contains(&(pc + run))
            && is_plain_move(proto, pc + run, skip)
        {
            let next = Instruction::from_word(proto.code[pc + run]);
            if u32::from(next.a()) != u32::from(first.a()) + run as u32
                || u32::from(next.b()) != u32::from(first.b()) + run as u32
            {
                break;
            }
            run += 1;
        }
        if run > 1 {
            proto.code[pc] = Instruction::abc(
                OpCode::MoveN,
                first.a(),
                first.b(),
                (run - 1) as u16,
            )
            .word();
            for nop_pc in pc + 1..pc + run {
                proto.code[nop_pc] =
                    Instruction::abc(OpCode::Nop, 0, 0, 0).word();
            }
        }
        pc += run;
    }
}

fn is_plain_move(proto: &Prototype, pc: usize, skip: &BTreeSet<usize>) -> bool {
    !skip.contains(&pc)
        && Instruction::from_word(proto.code[pc]).op() == Ok(OpCode::Move)
}

/// Recompute the register high-water mark from the instruction stream and
/// keep the larger of it and the allocator's own estimate.
fn settle_max_stack(proto: &mut Prototype) {
    let skip = pseudo_words(proto);
    let mut max = u32::from(proto.max_stack);
    for (pc, &word) in proto.code.iter().enumerate() {
        if skip.contains(&pc) {
            continue;
        }
        let ins = Instruction::from_word(word);
        let Ok(op) = ins.op() else { continue };
        let a = u32::from(ins.a());
        let b = u32::from(ins.b());
        let c = u32::from(ins.c());
        let top = match op {
            OpCode::MoveN => a + c + 1,
            OpCode::LoadNil => b + 1,
            OpCode::OpSelf => a + 2,
            OpCode::Concat => c + 1,
            OpCode::TForLoop => a + 3 + c,
            OpCode::ForLoop | OpCode::ForPrep => a + 4,
            OpCode::Call => a + b.max(c.saturating_sub(1)).max(1),
            _ => a + 1,
        };
        max = max.max(top);
    }
    proto.max_stack = max.min(0xff) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tol_asm::Instruction;

    fn proto_of(code: Vec<u32>) -> Prototype {
        Prototype {
            source: "@peephole".into(),
            max_stack: 8,
            code,
            ..Prototype::default()
        }
    }

    fn op_at(proto: &Prototype, pc: usize) -> OpCode {
        Instruction::from_word(proto.code[pc]).op().unwrap()
    }

    #[test]
    fn move_runs_collapse_to_moven() {
        let mut proto = proto_of(vec![
            Instruction::abc(OpCode::Move, 3, 0, 0).word(),
            Instruction::abc(OpCode::Move, 4, 1, 0).word(),
            Instruction::abc(OpCode::Move, 5, 2, 0).word(),
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        patch_code(&mut proto);
        let first = Instruction::from_word(proto.code[0]);
        assert_eq!(first.op(), Ok(OpCode::MoveN));
        assert_eq!((first.a(), first.b(), first.c()), (3, 0, 2));
        assert_eq!(op_at(&proto, 1), OpCode::Nop);
        assert_eq!(op_at(&proto, 2), OpCode::Nop);
    }

    #[test]
    fn non_contiguous_moves_stay() {
        let mut proto = proto_of(vec![
            Instruction::abc(OpCode::Move, 3, 0, 0).word(),
            Instruction::abc(OpCode::Move, 5, 1, 0).word(),
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        patch_code(&mut proto);
        assert_eq!(op_at(&proto, 0), OpCode::Move);
        assert_eq!(op_at(&proto, 1), OpCode::Move);
    }

    #[test]
    fn moves_split_by_jump_target_do_not_merge() {
        // JMP into the middle of the would-be run.
        let mut proto = proto_of(vec![
            Instruction::asbx(OpCode::Jmp, 0, 2).word(), // -> pc 3
            Instruction::abc(OpCode::Move, 3, 0, 0).word(),
            Instruction::abc(OpCode::Move, 4, 1, 0).word(),
            Instruction::abc(OpCode::Move, 5, 2, 0).word(),
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        patch_code(&mut proto);
        // Only the first two can merge; pc 3 is a jump target.
        let first = Instruction::from_word(proto.code[1]);
        assert_eq!(first.op(), Ok(OpCode::MoveN));
        assert_eq!(first.c(), 1);
        assert_eq!(op_at(&proto, 3), OpCode::Move);
    }

    #[test]
    fn jump_chains_resolve_and_self_jumps_nop() {
        let mut proto = proto_of(vec![
            Instruction::asbx(OpCode::Jmp, 0, 1).word(), // -> 2, itself a JMP
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            Instruction::asbx(OpCode::Jmp, 0, 1).word(), // -> 4
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
            Instruction::asbx(OpCode::Jmp, 0, 0).word(), // no-op self jump
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        patch_code(&mut proto);
        let first = Instruction::from_word(proto.code[0]);
        assert_eq!(first.op(), Ok(OpCode::Jmp));
        assert_eq!(first.sbx(), 3); // straight to pc 4
        assert_eq!(op_at(&proto, 5), OpCode::Nop);
    }

    #[test]
    fn closure_pseudo_moves_are_untouched() {
        let nested = Prototype {
            source: "@peephole".into(),
            num_upvalues: 2,
            ..Prototype::default()
        };
        let mut proto = proto_of(vec![
            Instruction::abx(OpCode::Closure, 0, 0).word(),
            Instruction::abc(OpCode::Move, 1, 0, 0).word(),
            Instruction::abc(OpCode::Move, 2, 1, 0).word(),
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        proto.protos.push(nested);
        patch_code(&mut proto);
        assert_eq!(op_at(&proto, 1), OpCode::Move);
        assert_eq!(op_at(&proto, 2), OpCode::Move);
    }

    #[test]
    fn setlist_extra_word_is_untouched() {
        let raw = 912u32;
        let mut proto = proto_of(vec![
            Instruction::abc(OpCode::SetList, 0, 1, 0).word(),
            raw,
            Instruction::abc(OpCode::Return, 0, 1, 0).word(),
        ]);
        patch_code(&mut proto);
        assert_eq!(proto.code[1], raw);
    }
}
