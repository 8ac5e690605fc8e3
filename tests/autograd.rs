use tapegrad::approx::approx_eq;
use tapegrad::backprop::backward;
use tapegrad::error::BackwardFault;
use tapegrad::gradcheck::check_gradients;
use tapegrad::{GradError, Graph, Tensor, tensor};

fn grad_of(graph: &Graph, id: tapegrad::TensorId) -> Tensor {
    graph.grad(id).unwrap().expect("gradient present").clone()
}

#[test]
fn mean_of_squares_has_closed_form_gradient() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([1.0, -2.0, 3.0, 0.5]));
    let sq = graph.mul(x, x).unwrap();
    let loss = graph.mean(sq).unwrap();
    backward(&mut graph, loss).unwrap();

    // d/dx mean(x²) = 2x / n
    let expected = tensor!([0.5, -1.0, 1.5, 0.25]);
    assert!(approx_eq(&grad_of(&graph, x), &expected));
}

#[test]
fn half_mean_of_squares_gives_x_over_n() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([1.0, -2.0, 3.0, 0.5]));
    let sq = graph.mul(x, x).unwrap();
    let half = graph.scale(sq, 0.5).unwrap();
    let loss = graph.mean(half).unwrap();
    backward(&mut graph, loss).unwrap();

    let expected = tensor!([0.25, -0.5, 0.75, 0.125]);
    assert!(approx_eq(&grad_of(&graph, x), &expected));
}

#[test]
fn two_backward_calls_double_the_gradient() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([[0.3, -0.7], [1.1, 0.2]]));
    let w = graph.parameter(tensor!([[0.5, -1.0], [2.0, 0.25]]));
    let y = graph.matmul(x, w).unwrap();
    let s = graph.sigmoid(y).unwrap();
    let loss = graph.mean(s).unwrap();

    backward(&mut graph, loss).unwrap();
    let once = grad_of(&graph, w);
    backward(&mut graph, loss).unwrap();
    let twice = grad_of(&graph, w);

    let doubled: Vec<f64> = once.data().iter().map(|g| 2.0 * g).collect();
    assert_eq!(twice.data(), doubled.as_slice());
}

#[test]
fn relu_gradient_is_zero_at_zero() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([-1.0, 0.0, 2.0]));
    let r = graph.relu(x).unwrap();
    let loss = graph.mean(r).unwrap();
    backward(&mut graph, loss).unwrap();
    assert_eq!(grad_of(&graph, x).data(), &[0.0, 0.0, 1.0 / 3.0]);
}

#[test]
fn nll_gradient_hits_only_the_labels() {
    let mut graph = Graph::new();
    let logp = graph.parameter(tensor!([[-0.1, -2.0, -3.0], [-1.5, -0.5, -2.5]]));
    let loss = graph.nll_loss(logp, &[2, 1]).unwrap();
    backward(&mut graph, loss).unwrap();
    assert_eq!(
        grad_of(&graph, logp).data(),
        &[0.0, 0.0, -0.5, 0.0, -0.5, 0.0]
    );
}

#[test]
fn linear_layer_passes_gradient_check() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([[0.2, -0.4, 1.0, 0.3], [-1.2, 0.5, 0.0, 0.8], [0.9, 0.1, -0.6, -0.2]]));
    let w = graph.parameter(tensor!([[0.1, -0.3], [0.7, 0.2], [-0.5, 0.4], [0.05, -0.9]]));
    let b = graph.parameter(tensor!([0.3, -0.1]));

    let build = |g: &mut Graph| {
        let y = g.linear(x, w, b)?;
        let s = g.sigmoid(y)?;
        g.mean(s)
    };
    for param in [x, w, b] {
        let report = check_gradients(&graph, param, 1e-5, build).unwrap();
        assert!(report.passed(1e-6), "{report:?}");
    }
}

#[test]
fn linear_layer_matches_differences_at_step_1e4() {
    // Gradients here are mostly larger than one, so the check is relative.
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([[2.0, -3.0], [1.5, 3.0]]));
    let w = graph.parameter(tensor!([[1.0, 0.5], [-0.5, 2.0]]));
    let b = graph.parameter(tensor!([0.5, -1.0]));

    let build = |g: &mut Graph| {
        let y = g.linear(x, w, b)?;
        let sq = g.mul(y, y)?;
        g.mean(sq)
    };
    for param in [x, w, b] {
        let report = check_gradients(&graph, param, 1e-4, build).unwrap();
        assert!(report.passed(1e-3), "{report:?}");
        assert!(report.analytic.data().iter().any(|g| g.abs() > 1.0));
    }
}

#[test]
fn classifier_head_passes_gradient_check() {
    let mut graph = Graph::new();
    let logits = graph.parameter(tensor!([[1.0, -0.5, 0.3, 2.0], [0.05, 0.1, -1.0, 0.4], [-2.0, 1.5, 0.7, 0.2]]));
    let report = check_gradients(&graph, logits, 1e-5, |g| {
        let h = g.relu(logits)?;
        let lp = g.log_softmax(h)?;
        g.nll_loss(lp, &[0, 3, 1])
    })
    .unwrap();
    assert!(report.passed(1e-6), "{report:?}");
}

#[test]
fn softmax_with_binary_cross_entropy_passes_gradient_check() {
    let mut graph = Graph::new();
    let z = graph.parameter(tensor!([[0.5, -1.0, 2.0], [0.0, 0.3, -0.7]]));
    let targets = tensor!([[1.0, 0.0, 0.0], [0.0, 0.0, 1.0]]);
    let report = check_gradients(&graph, z, 1e-5, |g| {
        let p = g.softmax(z)?;
        g.binary_cross_entropy(p, &targets)
    })
    .unwrap();
    assert!(report.passed(1e-6), "{report:?}");
}

#[test]
fn matmul_passes_gradient_check() {
    let mut graph = Graph::new();
    let a = graph.parameter(tensor!([[1.0, 2.0, -1.0], [0.5, 0.0, 3.0]]));
    let b = graph.parameter(tensor!([[0.2, -0.4], [1.0, 0.3], [-0.6, 0.8]]));
    let c = graph.input(tensor!([[1.0, -2.0], [0.5, 4.0]]));
    let build = |g: &mut Graph| {
        let ab = g.matmul(a, b)?;
        let weighted = g.mul(ab, c)?;
        g.mean(weighted)
    };
    for param in [a, b] {
        let report = check_gradients(&graph, param, 1e-5, build).unwrap();
        assert!(report.passed(1e-6), "{report:?}");
    }
}

#[test]
fn out_of_range_label_is_an_index_error() {
    let mut graph = Graph::new();
    let logp = graph.input(Tensor::zeros(&[2, 10]).unwrap());
    let err = graph.nll_loss(logp, &[3, 10]).unwrap_err();
    assert!(matches!(err, GradError::Index { index: 10, bound: 10 }));
    assert_eq!(err.to_string(), "index 10 out of range for 10 classes");
}

#[test]
fn rejected_backward_leaves_gradients_alone() {
    let mut graph = Graph::new();
    let w = graph.parameter(tensor!([1.0, 2.0]));
    let loss = graph.mean(w).unwrap();
    backward(&mut graph, loss).unwrap();
    let before = grad_of(&graph, w);

    let doubled = graph.scale(w, 2.0).unwrap();
    let err = backward(&mut graph, doubled).unwrap_err();
    assert!(matches!(
        err,
        GradError::InvalidBackward(BackwardFault::NotScalar { ref shape }) if shape == &[2]
    ));
    assert_eq!(grad_of(&graph, w), before);
}

#[test]
fn backward_never_changes_values() {
    let mut graph = Graph::new();
    let x = graph.parameter(tensor!([0.4, -0.2]));
    let s = graph.sigmoid(x).unwrap();
    let loss = graph.mean(s).unwrap();
    let value_before = graph.value(s).unwrap().clone();
    backward(&mut graph, loss).unwrap();
    assert_eq!(graph.value(s).unwrap(), &value_before);
    assert_eq!(graph.value(x).unwrap().data(), &[0.4, -0.2]);
}
