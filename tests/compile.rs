use f77::compile::{compile, CompileOptions, CompileSummary};

fn compile_source(source: &str) -> (String, CompileSummary) {
    let mut object = Vec::new();
    let summary = compile(source, CompileOptions::default(), &mut object, None)
        .expect("compilation must not hit a fatal error");
    (String::from_utf8(object).expect("CAL text is ASCII"), summary)
}

fn compile_clean(source: &str) -> String {
    let (text, summary) = compile_source(source);
    assert_eq!(summary.errors, 0, "unexpected errors in:\n{}", text);
    text
}

#[test]
fn constant_expression_folds_to_a_single_load() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I
      I = 2 + 3*4
      END
",
    );
    // 2+3*4 folds to 14: one load, one store, no multiply anywhere
    assert!(text.contains("         S1        14"), "{}", text);
    assert!(text.contains("         -1,A6     S1"), "{}", text);
    assert!(!text.contains("%mli"), "{}", text);
    // module bracket and prologue
    assert!(text.starts_with("         IDENT     P\n"), "{}", text);
    assert!(text.contains("@P       A7        A7-1"), "{}", text);
    assert!(text.contains("         R         @%inifio"), "{}", text);
    assert!(text.trim_end().ends_with("END"), "{}", text);
}

#[test]
fn equivalence_overlays_storage() {
    let text = compile_clean(
        "      PROGRAM P
      REAL A(10)
      INTEGER B
      EQUIVALENCE (A,B)
      SAVE
      B = 1
      A(1) = 2.0
      END
",
    );
    // both land on the same static word; the block stays 10 words
    assert!(text.contains("BSS       10"), "{}", text);
}

#[test]
fn do_loop_emits_trip_count_and_back_edge() {
    let text = compile_clean(
        "      PROGRAM P
      REAL A(10)
      INTEGER I
      DO 10 I = 1,10
      A(I) = I
   10 CONTINUE
      END
",
    );
    // (10-1+1)/1 folds to 10 with no divide call
    assert!(text.contains("        10"), "{}", text);
    assert!(!text.contains("%dvi"), "{}", text);
    // three-word loop frame and trip test
    assert!(text.contains("         A7        A7-1"), "{}", text);
    assert!(text.contains("         S0        2,A7"), "{}", text);
    assert!(text.contains("         JSZ"), "{}", text);
    // back edge and frame pop
    assert!(text.contains("         J         L0"), "{}", text);
    assert!(text.contains("         A7        A7+3"), "{}", text);
    // the register-held subscript is range checked
    assert!(text.contains("@%bnderr"), "{}", text);
}

#[test]
fn logical_if_compares_and_branches_on_false() {
    let text = compile_clean(
        "      PROGRAM P
      REAL X
      X = 1.5
      IF (X .LT. 0) X = -X
      END
",
    );
    // comparison produces the sign-mask logical value
    assert!(text.contains("<64"), "{}", text);
    assert!(text.contains("         JSM"), "{}", text);
    // branch around the negate-and-store on false
    assert!(text.contains("         JSP"), "{}", text);
    assert!(text.contains("-FS"), "{}", text);
}

#[test]
fn common_blocks_share_a_high_water_mark() {
    let text = compile_clean(
        "      SUBROUTINE ONE
      COMMON /B/ X(100), Y
      Y = 1.0
      END
      SUBROUTINE TWO
      COMMON /B/ U(50), V(51)
      V(1) = 2.0
      END
",
    );
    // one named COMMON section per unit; the limit settles at 101 words
    assert!(text.contains("B        SECTION   COMMON"), "{}", text);
    assert!(text.contains("@B       BSS       101"), "{}", text);
    assert!(!text.contains("BSS       151"), "{}", text);
}

#[test]
fn character_assignment_calls_the_string_copier() {
    let text = compile_clean(
        "      PROGRAM P
      CHARACTER*8 S
      S = 'HELLO'
      END
",
    );
    assert!(text.contains("         R         @%cpystr"), "{}", text);
    assert!(text.contains("'HELLO'"), "{}", text);
    // descriptors carry the length in the high half
    assert!(text.contains("<32"), "{}", text);
}

#[test]
fn mixed_arithmetic_converts_through_cif() {
    let text = compile_clean(
        "      PROGRAM P
      REAL X
      INTEGER I
      I = 3
      X = I + 1.5
      END
",
    );
    assert!(text.contains("         R         %cif"), "{}", text);
    assert!(text.contains("+FS"), "{}", text);
}

#[test]
fn integer_multiply_calls_the_primitive() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I, J
      I = 3
      J = I*I
      END
",
    );
    assert!(text.contains("         R         %mli"), "{}", text);
    // result comes back in S7
    assert!(text.contains("        S7"), "{}", text);
}

#[test]
fn computed_goto_builds_a_jump_table() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I
      I = 2
      GOTO (10, 20, 30), I
   10 CONTINUE
   20 CONTINUE
   30 CONTINUE
      END
",
    );
    assert!(text.contains("         CON       L0"), "{}", text);
    assert!(text.contains("         B01       A1"), "{}", text);
    assert!(text.contains("         J         B01"), "{}", text);
}

#[test]
fn assigned_goto_ignores_the_label_list() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER K
      ASSIGN 10 TO K
      GOTO K, (10, 20)
   10 CONTINUE
   20 CONTINUE
      END
",
    );
    assert!(text.contains("         J         B01"), "{}", text);
}

#[test]
fn formatted_write_sequences_the_runtime_calls() {
    let text = compile_clean(
        "      PROGRAM P
      REAL X
      X = 1.0
      WRITE (6, 100) X
  100 FORMAT(F10.3)
      END
",
    );
    assert!(text.contains("         A7        A7-4"), "{}", text);
    assert!(text.contains("         R         @%outfmt"), "{}", text);
    assert!(text.contains("         R         @%endfmt"), "{}", text);
    assert!(text.contains("'(F10.3)'"), "{}", text);
}

#[test]
fn block_if_else_chains() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I, J
      I = 1
      IF (I .GT. 0) THEN
      J = 1
      ELSEIF (I .LT. 0) THEN
      J = 2
      ELSE
      J = 3
      ENDIF
      END
",
    );
    let jumps = text.matches("         J         L").count();
    assert!(jumps >= 2, "expected else-chain jumps:\n{}", text);
}

#[test]
fn statement_functions_expand_inline() {
    let text = compile_clean(
        "      PROGRAM P
      REAL X, Y
      SQ(Z) = Z*Z
      X = 2.0
      Y = SQ(X)
      END
",
    );
    // expansion multiplies in place of any call
    assert!(text.contains("*FS"), "{}", text);
    assert!(!text.contains("R         @SQ"), "{}", text);
}

#[test]
fn external_calls_push_argument_addresses() {
    let text = compile_clean(
        "      PROGRAM P
      REAL X
      X = 1.0
      CALL SUB(X)
      END
",
    );
    assert!(text.contains("         R         @SUB"), "{}", text);
    assert!(text.contains("         A2        A6-1"), "{}", text);
}

#[test]
fn functions_return_through_s7() {
    let text = compile_clean(
        "      INTEGER FUNCTION TWICE(N)
      INTEGER N
      TWICE = N + N
      END
",
    );
    assert!(text.starts_with("         IDENT     TWICE"), "{}", text);
    // epilogue loads the result slot into S7
    assert!(text.contains("         S7        -1,A6"), "{}", text);
    assert!(text.contains("         J         B00"), "{}", text);
}

#[test]
fn undefined_labels_are_reported_at_end() {
    let (text, summary) = compile_source(
        "      PROGRAM P
      GOTO 99
      END
",
    );
    assert!(summary.errors > 0, "{}", text);
}

#[test]
fn misplaced_statements_are_diagnosed_and_skipped() {
    let (_, summary) = compile_source(
        "      PROGRAM P
      INTEGER I
      I = 1
      DIMENSION Q(10)
      END
",
    );
    assert!(summary.errors > 0);
}

#[test]
fn compilation_continues_past_errors() {
    let (text, summary) = compile_source(
        "      PROGRAM P
      INTEGER I
      I = 1/0
      I = 5
      END
",
    );
    assert_eq!(summary.errors, 1);
    // the second assignment still compiled
    assert!(text.contains("         S1        5"), "{}", text);
}

#[test]
fn long_names_are_hashed_for_the_linker() {
    let text = compile_clean(
        "      PROGRAM P
      CALL VERYLONGSUBNAME(1)
      END
",
    );
    // @ + 3 head characters + 4 hash digits
    let called = text
        .lines()
        .find(|l| l.contains("R         @VER"))
        .expect("hashed call expected");
    let name = called.trim().rsplit(' ').next().unwrap();
    assert_eq!(name.len(), 8, "{}", name);
}

#[test]
fn source_echo_comments_the_object() {
    let mut object = Vec::new();
    let summary = compile(
        "      PROGRAM P
      END
",
        CompileOptions { echo_source: true },
        &mut object,
        None,
    )
    .unwrap();
    assert_eq!(summary.errors, 0);
    let text = String::from_utf8(object).unwrap();
    assert!(text.contains("*      PROGRAM P"), "{}", text);
}

#[test]
fn concatenation_calls_the_string_runtime() {
    let text = compile_clean(
        "      PROGRAM P
      CHARACTER*4 A
      CHARACTER*8 C
      A = 'AB'
      C = A // 'CD'
      END
",
    );
    assert!(text.contains("         R         @%catstr"), "{}", text);
    assert!(text.contains("         R         @%cpystr"), "{}", text);
}

#[test]
fn logical_operators_use_the_bitwise_unit() {
    let text = compile_clean(
        "      PROGRAM P
      LOGICAL A, B, C
      A = .TRUE.
      B = .FALSE.
      C = A .AND. .NOT. B .OR. A
      END
",
    );
    assert!(text.contains("&"), "{}", text);
    assert!(text.contains("!"), "{}", text);
    assert!(text.contains("#"), "{}", text);
}

#[test]
fn parameters_fold_into_expressions() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER N
      PARAMETER (M=10)
      N = M + 4
      END
",
    );
    // M folds, so the sum folds too
    assert!(text.contains("         S1        14"), "{}", text);
}

#[test]
fn arithmetic_if_branches_three_ways() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I
      I = 0
      IF (I - 1) 10, 20, 30
   10 CONTINUE
   20 CONTINUE
   30 CONTINUE
      END
",
    );
    assert!(text.contains("         JSM"), "{}", text);
    assert!(text.contains("         JSZ"), "{}", text);
}

#[test]
fn data_statements_initialise_the_static_area() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I, J(3)
      DATA I/5/, J/3*7/
      I = I + 1
      END
",
    );
    assert!(text.contains("CON       5"), "{}", text);
    assert!(text.contains("CON       7"), "{}", text);
}

#[test]
fn adjustable_arrays_fill_a_dope_vector() {
    let text = compile_clean(
        "      SUBROUTINE FILL(A, N)
      INTEGER N
      REAL A(N)
      A(1) = 0.0
      END
",
    );
    // dope words: base address plus one bound pair
    assert!(text.contains("         -3,A6     S1"), "{}", text);
}

#[test]
fn shared_do_termination_closes_all_loops() {
    let text = compile_clean(
        "      PROGRAM P
      INTEGER I, J, K
      DO 10 I = 1,3
      DO 10 J = 1,3
      K = I + J
   10 CONTINUE
      END
",
    );
    // two loop frames are dropped at the shared terminator
    let pops = text.matches("         A7        A7+3").count();
    assert_eq!(pops, 2, "{}", text);
}
