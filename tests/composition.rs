use aspectron::{AdviceKind, Aspect, BuildError, ContextError, Process, advice};
use proptest::prelude::*;

type Unit = Aspect<(), ContextError>;

fn before(name: &str, depends_on: &[&str]) -> Unit {
    Aspect::new(name).before(
        advice::before(|_| async { Ok(()) }).depends_on(depends_on.iter().copied()),
    )
}

fn build(aspects: Vec<Unit>) -> Result<Process<(), ContextError>, BuildError> {
    Process::builder().aspects(aspects).build()
}

#[test]
fn duplicate_names_are_rejected() {
    let error = build(vec![before("a", &[]), before("a", &[])]).unwrap_err();
    assert_eq!(error, BuildError::DuplicateAspect("a".to_string()));
}

#[test]
fn unknown_dependency_is_rejected() {
    let error = build(vec![before("a", &["ghost"])]).unwrap_err();
    assert_eq!(
        error,
        BuildError::UnknownDependency {
            kind: AdviceKind::Before,
            aspect: "a".to_string(),
            dependency: "ghost".to_string(),
        }
    );
}

#[test]
fn cycle_names_its_members() {
    let error = build(vec![
        before("a", &["b"]),
        before("free", &[]),
        before("b", &["a"]),
    ])
    .unwrap_err();
    assert_eq!(
        error,
        BuildError::DependencyCycle {
            kind: AdviceKind::Before,
            aspects: vec!["a".to_string(), "b".to_string()],
        }
    );
    assert_eq!(
        error.to_string(),
        "before advice dependencies form a cycle between: a, b"
    );
}

#[test]
fn self_dependency_is_a_cycle() {
    let error = build(vec![before("a", &["a"])]).unwrap_err();
    assert_eq!(
        error,
        BuildError::DependencyCycle {
            kind: AdviceKind::Before,
            aspects: vec!["a".to_string()],
        }
    );
}

#[test]
fn unconstrained_advice_keep_input_order() {
    let process = build(vec![before("b", &[]), before("c", &["a"]), before("a", &[])]).unwrap();
    assert_eq!(process.order(AdviceKind::Before), ["b", "a", "c"]);
    assert_eq!(process.aspects(), ["b", "c", "a"]);
}

#[test]
fn dependency_without_same_kind_advice_is_ignored() {
    let logger: Unit = Aspect::new("logger").after(advice::after(|_| async { Ok(()) }));
    let process = build(vec![before("auth", &["logger"]), logger]).unwrap();

    assert_eq!(process.order(AdviceKind::Before), ["auth"]);
    assert_eq!(process.order(AdviceKind::After), ["logger"]);
    assert!(process.order(AdviceKind::Around).is_empty());
}

#[test]
fn chains_are_ordered_per_kind() {
    let first: Unit = Aspect::new("first")
        .before(advice::before(|_| async { Ok(()) }))
        .after(advice::after(|_| async { Ok(()) }).depends_on(["second"]));
    let second: Unit = Aspect::new("second")
        .before(advice::before(|_| async { Ok(()) }).depends_on(["first"]))
        .after(advice::after(|_| async { Ok(()) }));

    let process = build(vec![first, second]).unwrap();

    assert_eq!(process.order(AdviceKind::Before), ["first", "second"]);
    assert_eq!(process.order(AdviceKind::After), ["second", "first"]);
}

// Aspect `i` may depend on any `j < i`; aspects are added in reverse so that
// input order never satisfies the edges by accident.
fn acyclic_graph() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1usize..10).prop_flat_map(|size| {
        (0..size)
            .map(|node| proptest::sample::subsequence((0..node).collect::<Vec<_>>(), 0..=node))
            .collect::<Vec<_>>()
    })
}

proptest! {
    #[test]
    fn composed_order_respects_every_edge(graph in acyclic_graph()) {
        let name = |node: usize| format!("aspect-{node}");
        let aspects = (0..graph.len())
            .rev()
            .map(|node| {
                let dependencies: Vec<String> = graph[node].iter().map(|&d| name(d)).collect();
                let dependencies: Vec<&str> = dependencies.iter().map(String::as_str).collect();
                before(&name(node), &dependencies)
            })
            .collect();

        let process = build(aspects).unwrap();
        let order = process.order(AdviceKind::Before);
        prop_assert_eq!(order.len(), graph.len());

        let position = |node: usize| order.iter().position(|n| *n == name(node)).unwrap();
        for (node, dependencies) in graph.iter().enumerate() {
            for &dependency in dependencies {
                prop_assert!(position(dependency) < position(node));
            }
        }
    }

    #[test]
    fn closing_a_path_into_a_cycle_fails(length in 2usize..8) {
        let name = |node: usize| format!("aspect-{node}");
        let aspects = (0..length)
            .map(|node| {
                let next = name((node + 1) % length);
                before(&name(node), &[next.as_str()])
            })
            .collect();

        let error = build(aspects).unwrap_err();
        let is_cycle = matches!(error, BuildError::DependencyCycle { ref aspects, .. } if aspects.len() == length);
        prop_assert!(is_cycle);
    }
}
