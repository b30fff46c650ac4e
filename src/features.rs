use crate::engine::{Direction, Point, SnakeEngine};

pub const FEATURE_COUNT: usize = 24;

/// Neighbour offsets clockwise from north, aligned with `Direction::ALL`.
const NEIGHBOURS: [(i32, i32); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

fn flag(b: bool) -> f32 {
    if b {
        1.0
    } else {
        0.0
    }
}

fn sign(v: i32) -> f32 {
    v.signum() as f32
}

/// Number of free cells in a straight line from the head before a wall or body cell.
fn free_run(engine: &SnakeEngine, dir: Direction) -> u32 {
    let (dx, dy) = dir.delta();
    let mut p = engine.head().offset(dx, dy);
    let mut count = 0;

    while !engine.is_blocked(p) {
        count += 1;
        p = p.offset(dx, dy);
    }

    count
}

/// 24 features: heading (4), danger ring (8), food (5), body (3), free space (4)
pub fn extract_features(engine: &SnakeEngine) -> Vec<f32> {
    let head = engine.head();
    let food = engine.food;
    let w = engine.width as f32;
    let h = engine.height as f32;

    let mut features = Vec::with_capacity(FEATURE_COUNT);

    // Heading one-hot
    for dir in Direction::ALL {
        features.push(flag(engine.direction == dir));
    }

    // Danger one step away
    for (dx, dy) in NEIGHBOURS {
        features.push(flag(engine.is_blocked(head.offset(dx, dy))));
    }

    // Food relative to head
    let fdx = food.x - head.x;
    let fdy = food.y - head.y;
    features.push(sign(fdx));
    features.push(sign(fdy));
    features.push(fdx.abs() as f32 / w);
    features.push(fdy.abs() as f32 / h);
    features.push(head.manhattan(food) as f32 / (w + h));

    // Length and tail direction
    features.push(engine.len() as f32 / (w * h));
    let tail: Point = engine.snake[engine.len() - 1];
    features.push(sign(tail.x - head.x));
    features.push(sign(tail.y - head.y));

    // Free space per cardinal direction
    let span = w.max(h);
    for dir in Direction::ALL {
        features.push(free_run(engine, dir) as f32 / span);
    }

    debug_assert_eq!(features.len(), FEATURE_COUNT);
    features
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvConfig, RewardConfig};

    fn engine() -> SnakeEngine {
        SnakeEngine::new(&EnvConfig::default(), RewardConfig::default())
    }

    #[test]
    fn initial_state_encoding() {
        let mut engine = engine();
        engine.food = Point::new(15, 4);
        let f = extract_features(&engine);

        assert_eq!(f.len(), FEATURE_COUNT);
        assert!(f.iter().all(|v| v.is_finite()));

        // Heading Right
        assert_eq!(&f[0..4], &[0.0, 1.0, 0.0, 0.0]);
        // Only the west neighbour (the neck) is blocked
        assert_eq!(&f[4..12], &[0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
        // Food up and to the right
        assert_eq!(f[12], 1.0);
        assert_eq!(f[13], -1.0);
        assert_eq!(f[14], 5.0 / 20.0);
        assert_eq!(f[15], 6.0 / 20.0);
        assert_eq!(f[16], 11.0 / 40.0);
        // Tail two cells to the left
        assert_eq!(f[17], 3.0 / 400.0);
        assert_eq!(f[18], -1.0);
        assert_eq!(f[19], 0.0);
        // Free runs: up 10, right 9, down 9, left 0
        assert_eq!(&f[20..24], &[10.0 / 20.0, 9.0 / 20.0, 9.0 / 20.0, 0.0]);
    }

    #[test]
    fn corner_marks_walls_as_danger() {
        let mut engine = engine();
        engine.snake = vec![Point::new(0, 0), Point::new(1, 0), Point::new(2, 0)];
        engine.direction = Direction::Left;
        engine.food = Point::new(5, 5);
        let f = extract_features(&engine);

        assert_eq!(&f[0..4], &[0.0, 0.0, 0.0, 1.0]);
        // N, NE, E (body), SE free, S free, SW, W, NW
        assert_eq!(&f[4..12], &[1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        assert_eq!(f[20], 0.0);
        assert_eq!(f[23], 0.0);
        assert_eq!(f[22], 19.0 / 20.0);
    }

    #[test]
    fn single_cell_snake_has_no_tail_direction() {
        let mut engine = engine();
        engine.snake = vec![Point::new(3, 3)];
        let f = extract_features(&engine);
        assert_eq!(f[18], 0.0);
        assert_eq!(f[19], 0.0);
    }
}
