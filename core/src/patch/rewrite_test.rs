#[cfg(test)]
mod tests {
    use crate::code::{Const, UnitBuilder};
    use crate::error::PatchError;
    use crate::ir::{Opcode, Sequence, decode, encode};
    use crate::patch::{Pattern, PatternOp, find_matches, match_and_replace};

    fn body(build: impl FnOnce(&mut UnitBuilder)) -> Sequence {
        let mut b = UnitBuilder::function("f", &["a", "b"]);
        build(&mut b);
        decode(&b.build().expect("build")).expect("decode")
    }

    fn ops(seq: &Sequence) -> Vec<(Opcode, Option<u8>)> {
        seq.iter().map(|i| (i.op, i.raw())).collect()
    }

    #[test]
    fn test_matches_do_not_overlap() {
        let seq = body(|b| {
            b.op(Opcode::Nop).op(Opcode::Nop).op(Opcode::Nop).load_const(Const::None).op(Opcode::ReturnValue);
        });
        let pattern = Pattern::new(vec![PatternOp::bare(Opcode::Nop), PatternOp::bare(Opcode::Nop)]);
        assert_eq!(find_matches(&seq, &pattern), vec![0]);
        assert!(find_matches(&seq, &Pattern::default()).is_empty());
    }

    #[test]
    fn test_missing_pattern_leaves_sequence_untouched() {
        let mut seq = body(|b| {
            b.load_fast("a").op(Opcode::ReturnValue);
        });
        let before = encode(&seq).expect("encode");
        let pattern = Pattern::new(vec![PatternOp::bare(Opcode::PopTop)]);
        assert_eq!(
            match_and_replace(&mut seq, &pattern, &Pattern::default()),
            Err(PatchError::PatternNotFound)
        );
        assert_eq!(encode(&seq).expect("encode"), before);
    }

    #[test]
    fn test_captures_are_per_occurrence_and_in_order() {
        let mut seq = body(|b| {
            b.load_fast("a")
                .load_fast("b")
                .op(Opcode::BinarySubtract)
                .load_fast("b")
                .load_fast("a")
                .op(Opcode::BinarySubtract)
                .op(Opcode::BinaryMultiply)
                .op(Opcode::ReturnValue);
        });
        let before = Pattern::new(vec![
            PatternOp::bind(Opcode::LoadFast, "$x"),
            PatternOp::bind(Opcode::LoadFast, "$x"),
            PatternOp::bare(Opcode::BinarySubtract),
        ]);
        let after = Pattern::new(vec![
            PatternOp::bind(Opcode::LoadFast, "$x"),
            PatternOp::bind(Opcode::LoadFast, "$x"),
            PatternOp::bare(Opcode::BinaryAdd),
        ]);
        assert_eq!(match_and_replace(&mut seq, &before, &after), Ok(2));
        assert_eq!(
            ops(&seq),
            vec![
                (Opcode::LoadFast, Some(0)),
                (Opcode::LoadFast, Some(1)),
                (Opcode::BinaryAdd, Some(0)),
                (Opcode::LoadFast, Some(1)),
                (Opcode::LoadFast, Some(0)),
                (Opcode::BinaryAdd, Some(0)),
                (Opcode::BinaryMultiply, Some(0)),
                (Opcode::ReturnValue, Some(0)),
            ]
        );
        assert_eq!(seq.at(3).var_name(), Some("b"));
    }

    #[test]
    fn test_unbound_wildcard_fails_without_side_effects() {
        let mut seq = body(|b| {
            b.load_fast("a").op(Opcode::ReturnValue);
        });
        let before = Pattern::new(vec![PatternOp::any(Opcode::LoadFast)]);
        let after = Pattern::new(vec![PatternOp::bind(Opcode::LoadFast, "$missing")]);
        assert_eq!(
            match_and_replace(&mut seq, &before, &after),
            Err(PatchError::UnboundWildcard { symbol: "$missing".to_string() })
        );
        assert_eq!(seq.len(), 2);
    }

    #[test]
    fn test_substitution_rewires_consumers() {
        // `a * 2` becomes the constant `None`: one input, one output replaced
        // by no input, one output.
        let mut seq = body(|b| {
            b.load_fast("a").load_const(Const::Int(2)).op(Opcode::BinaryMultiply).op(Opcode::ReturnValue);
        });
        let before = Pattern::new(vec![PatternOp::arg(Opcode::LoadConst, 1), PatternOp::bare(Opcode::BinaryMultiply)]);
        let after = Pattern::new(vec![PatternOp::arg(Opcode::LoadConst, 0)]);
        assert_eq!(match_and_replace(&mut seq, &before, &after), Ok(1));

        let ids = seq.ids().to_vec();
        assert_eq!(ids.len(), 3);
        assert_eq!(seq.get(ids[2]).producers, vec![ids[1]]);
        for instr in seq.iter() {
            for producer in &instr.producers {
                assert!(seq.index_of(*producer).is_some(), "dangling producer in {}", instr);
            }
        }
    }

    #[test]
    fn test_deleted_jump_target_moves_to_next_live() {
        let mut seq = body(|b| {
            let skip = b.label();
            b.load_fast("a")
                .jump(Opcode::PopJumpIfFalse, skip)
                .load_fast("b")
                .op(Opcode::ReturnValue)
                .bind(skip)
                .op(Opcode::Nop)
                .load_const(Const::None)
                .op(Opcode::ReturnValue);
        });
        let jump = seq.ids()[1];
        let before = Pattern::new(vec![PatternOp::bare(Opcode::Nop)]);
        assert_eq!(match_and_replace(&mut seq, &before, &Pattern::default()), Ok(1));
        assert_eq!(seq.target_index(jump), Some(4));
        assert_eq!(seq.at(4).op, Opcode::LoadConst);
        assert_eq!(encode(&seq).expect("encode")[3], 8);
    }

    #[test]
    fn test_bound_jump_keeps_its_target() {
        let mut seq = body(|b| {
            let end = b.label();
            let other = b.label();
            b.load_fast("a")
                .jump(Opcode::PopJumpIfFalse, other)
                .load_fast("b")
                .op(Opcode::PopTop)
                .jump(Opcode::JumpForward, end)
                .bind(other)
                .load_fast("a")
                .op(Opcode::PopTop)
                .bind(end)
                .load_const(Const::None)
                .op(Opcode::ReturnValue);
        });
        let before = Pattern::new(vec![PatternOp::bare(Opcode::PopTop), PatternOp::bind(Opcode::JumpForward, "$1")]);
        let after = Pattern::new(vec![PatternOp::bind(Opcode::JumpForward, "$1")]);
        assert_eq!(match_and_replace(&mut seq, &before, &after), Ok(1));

        let jump = seq.ids()[3];
        assert_eq!(seq.get(jump).op, Opcode::JumpForward);
        assert_eq!(seq.at(seq.target_index(jump).expect("target")).op, Opcode::LoadConst);
        // The conditional jump now lands one slot earlier.
        assert_eq!(seq.at(1).raw(), Some(8));
        assert_eq!(seq.get(jump).raw(), Some(4));
    }

    #[test]
    fn test_inner_pattern_jumps_link_to_new_copies() {
        let mut seq = body(|b| {
            b.load_fast("a").op(Opcode::ReturnValue);
        });
        let before = Pattern::new(vec![PatternOp::arg(Opcode::LoadFast, 0)]);
        let after = Pattern::new(vec![
            PatternOp::arg(Opcode::LoadFast, 0),
            PatternOp::jump_to(Opcode::JumpForward, 3),
            PatternOp::bare(Opcode::Nop),
            PatternOp::bare(Opcode::Nop),
        ]);
        assert_eq!(match_and_replace(&mut seq, &before, &after), Ok(1));
        let jump = seq.ids()[1];
        assert_eq!(seq.target_index(jump), Some(3));
        assert_eq!(encode(&seq).expect("encode"), vec![124, 0, 110, 2, 9, 0, 9, 0, 83, 0]);
    }
}
